//! Attribution credits collected from data providers.
//!
//! Hosting endpoints declare attribution requirements alongside the tileset
//! they serve. The bootstrap pushes those into a [`CreditSystem`]; the host
//! reads a snapshot each frame and renders it however its UI requires.

use parking_lot::Mutex;

/// Handle to one registered credit.
///
/// Credits are deduplicated: registering the same HTML twice returns the
/// same handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Credit(usize);

/// Collects attribution HTML snippets from data providers.
#[derive(Debug, Default)]
pub struct CreditSystem {
    credits: Mutex<Vec<String>>,
}

impl CreditSystem {
    /// Creates an empty credit system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an attribution snippet, returning its handle.
    ///
    /// Registering HTML that is already present returns the existing handle
    /// instead of storing a duplicate.
    pub fn add_credit(&self, html: impl Into<String>) -> Credit {
        let html = html.into();
        let mut credits = self.credits.lock();
        if let Some(index) = credits.iter().position(|existing| *existing == html) {
            return Credit(index);
        }
        credits.push(html);
        Credit(credits.len() - 1)
    }

    /// Returns the HTML for a credit handle.
    pub fn html(&self, credit: Credit) -> Option<String> {
        self.credits.lock().get(credit.0).cloned()
    }

    /// Returns a snapshot of all registered attribution HTML.
    pub fn snapshot(&self) -> Vec<String> {
        self.credits.lock().clone()
    }
}

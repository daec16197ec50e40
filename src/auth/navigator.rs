//! The page the flow runs in
//!
//! External signer apps talk back by navigating the page, and the user
//! drives the flow by switching away and back. Both arrive as [`PageEvent`]s;
//! outgoing navigation goes through a [`Navigator`].

use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// Outgoing side of the page: hand-offs and the visible URL
pub trait Navigator: Send + Sync {
    /// Navigate away, either to an external app scheme or to a post-login page
    fn open(&self, target: &Url) -> anyhow::Result<()>;

    /// URL currently shown, if the page knows one
    fn current_url(&self) -> Option<Url>;

    /// Replace the visible URL without reloading
    fn replace_url(&self, url: Url);
}

/// Things that happen to the page while a flow is waiting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    /// The page was navigated to `url` (an external app returning)
    Navigated(Url),
    /// The tab became visible again
    VisibilityRegained,
    /// User went back to method selection
    GoBack,
    /// User closed the login dialog
    Close,
}

/// Resolve on the first `GoBack` or `Close`, skipping anything else
///
/// Never resolves once the event source is gone.
pub async fn next_exit(events: &mut mpsc::Receiver<PageEvent>) -> PageEvent {
    loop {
        match events.recv().await {
            Some(event @ (PageEvent::GoBack | PageEvent::Close)) => return event,
            Some(other) => debug!("Ignoring {:?} while busy", other),
            None => return std::future::pending().await,
        }
    }
}

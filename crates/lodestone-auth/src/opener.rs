use std::fmt::Debug;

use tracing::{info, warn};

/// Opens URLs in the user's default handler
pub trait UrlOpener: Send + Sync + Debug {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// The system default browser
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that_detached(url)
    }
}

/// Open `url`, logging failures instead of returning them
pub(crate) fn open_or_warn(opener: &dyn UrlOpener, url: &str) {
    match opener.open(url) {
        Ok(()) => info!("Opened {} in the browser", url),
        Err(e) => warn!("Could not open browser ({}), open {} manually", e, url),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::UrlOpener;

    /// Remembers every URL instead of opening it
    #[derive(Debug, Default)]
    pub struct RecordingOpener {
        urls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingOpener {
        pub fn failing() -> Self {
            Self {
                urls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }

        /// Opening happens on a blocking worker, give it a moment
        pub async fn wait_for_urls(&self, count: usize) -> Vec<String> {
            for _ in 0..200 {
                if self.urls.lock().unwrap().len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.urls()
        }
    }

    impl UrlOpener for RecordingOpener {
        fn open(&self, url: &str) -> std::io::Result<()> {
            self.urls.lock().unwrap().push(url.to_string());
            if self.fail {
                return Err(std::io::Error::other("no browser available"));
            }
            Ok(())
        }
    }
}

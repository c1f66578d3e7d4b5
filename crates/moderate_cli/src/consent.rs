#![forbid(unsafe_code)]

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use moderate_core::ConsentDriver;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use url::Url;

/// Opens the consent page in the system browser and reads the callback URL
/// the user pastes back from the address bar.
pub struct BrowserConsent;

#[async_trait]
impl ConsentDriver for BrowserConsent {
	async fn authorize(&self, url: Url) -> anyhow::Result<String> {
		eprintln!("Opening the Kick authorization page in your browser:\n\n\t{url}\n");
		if let Err(e) = open::that(url.as_str()) {
			warn!(error = %e, "failed to open browser; open the url manually");
		}
		eprintln!("After approving, paste the full URL you were redirected to and press Enter:");

		let mut lines = BufReader::new(tokio::io::stdin()).lines();
		let line = lines
			.next_line()
			.await
			.context("read callback url from stdin")?
			.ok_or_else(|| anyhow!("stdin closed before a callback url was entered"))?;

		let callback = line.trim();
		if callback.is_empty() {
			return Err(anyhow!("no callback url entered"));
		}
		Ok(callback.to_string())
	}
}

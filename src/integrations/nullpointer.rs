//! Paste-bin upload of job logs so notification messages can link the full
//! output instead of inlining it.

use crate::core::Context;

const DEFAULT_INSTANCE_URL: &str = "https://0x0.st/";

/// Upload text to a nullpointer instance and return the paste URL, or None
/// on any failure (the caller treats the link as optional decoration).
pub async fn upload_text(ctx: &Context, text: String, instance_url: Option<&str>) -> Option<String> {
    let url = instance_url.unwrap_or(DEFAULT_INSTANCE_URL);

    let part = reqwest::multipart::Part::text(text).file_name("output.log");
    let form = reqwest::multipart::Form::new().part("file", part);

    let resp = match ctx.http.post(url).multipart(form).send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!("Log upload failed: {e}");
            return None;
        }
    };
    if !resp.status().is_success() {
        tracing::debug!("Log upload rejected: {}", resp.status());
        return None;
    }

    let paste_url = resp.text().await.ok()?.trim().to_string();
    if paste_url.starts_with("http") {
        Some(paste_url)
    } else {
        None
    }
}

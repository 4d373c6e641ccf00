//! Live checks against Slack and Google Drive.
//! Run with: cargo test -p image-archiver-providers --test live_providers -- --ignored --nocapture

use std::time::Duration;

use image_archiver_providers::{slack, MessageFeed, SlackClient, SlackConfig};

#[tokio::test]
#[ignore] // requires SLACK_TOKEN and SLACK_CHANNEL_ID
async fn test_live_history_page() {
    let client = SlackClient::new(SlackConfig {
        token: std::env::var("SLACK_TOKEN").expect("SLACK_TOKEN"),
        api_base: slack::DEFAULT_API_BASE.to_owned(),
        timeout: Duration::from_secs(30),
    })
    .unwrap();
    let channel = std::env::var("SLACK_CHANNEL_ID").expect("SLACK_CHANNEL_ID");

    let page = client.list_page(&channel, None, 20).await.unwrap();
    let files: usize = page.messages.iter().map(|m| m.files.len()).sum();
    println!(
        "{} messages, {} files, more pages: {}",
        page.messages.len(),
        files,
        page.next_cursor.is_some()
    );
}

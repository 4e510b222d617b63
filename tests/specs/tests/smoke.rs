// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `corral` binary and exercise
//! the HTTP control surface and the WebSocket stream.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use corral_specs::{CorralProcess, TOKEN};

const TIMEOUT: Duration = Duration::from_secs(10);

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn spawn_session(corral: &CorralProcess) -> anyhow::Result<String> {
    let resp = client()
        .post(format!("{}/api/v1/sessions", corral.base_url()))
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"name": "smoke"}))
        .send()
        .await?;
    anyhow::ensure!(resp.status().as_u16() == 201, "spawn failed: {}", resp.status());
    let body: serde_json::Value = resp.json().await?;
    Ok(body["id"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let corral = CorralProcess::start()?;
    corral.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value =
        reqwest::get(format!("{}/api/v1/health", corral.base_url())).await?.json().await?;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["sessions"], 0);
    Ok(())
}

#[tokio::test]
async fn http_requires_token() -> anyhow::Result<()> {
    let corral = CorralProcess::start()?;
    corral.wait_healthy(TIMEOUT).await?;

    let resp = client().get(format!("{}/api/v1/sessions", corral.base_url())).send().await?;
    assert_eq!(resp.status().as_u16(), 401);
    Ok(())
}

#[tokio::test]
async fn spawn_kill_roundtrip() -> anyhow::Result<()> {
    let corral = CorralProcess::start()?;
    corral.wait_healthy(TIMEOUT).await?;

    let id = spawn_session(&corral).await?;
    assert_eq!(id.len(), 8);

    let resp = client()
        .delete(format!("{}/api/v1/sessions/{id}", corral.base_url()))
        .bearer_auth(TOKEN)
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 200);

    // Second kill: the id is gone.
    let resp = client()
        .delete(format!("{}/api/v1/sessions/{id}", corral.base_url()))
        .bearer_auth(TOKEN)
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 404);
    Ok(())
}

#[tokio::test]
async fn ws_rejects_bad_token() -> anyhow::Result<()> {
    let corral = CorralProcess::start()?;
    corral.wait_healthy(TIMEOUT).await?;

    let url = format!("{}/ws?token=wrong", corral.base_url().replace("http", "ws"));
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
    Ok(())
}

#[tokio::test]
async fn ws_subscribe_then_echo_roundtrip() -> anyhow::Result<()> {
    let corral = CorralProcess::start()?;
    corral.wait_healthy(TIMEOUT).await?;

    let id = spawn_session(&corral).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(corral.ws_url()).await?;

    // First frame is the full session list.
    let sessions = next_json(&mut ws).await?;
    assert_eq!(sessions["type"], "sessions");

    ws.send(Message::Text(
        serde_json::json!({"type": "subscribe", "sessionId": id, "cols": 80, "rows": 24})
            .to_string()
            .into(),
    ))
    .await?;

    // The scrollback snapshot arrives before any output frame; lifecycle
    // frames (session:created, session:stateChanged) may interleave.
    loop {
        let frame = next_json(&mut ws).await?;
        anyhow::ensure!(frame["type"] != "output", "output before scrollback: {frame}");
        if frame["type"] == "scrollback" {
            assert_eq!(frame["sessionId"], id);
            break;
        }
    }

    // cat echoes whatever we feed it back through the PTY.
    ws.send(Message::Text(
        serde_json::json!({"type": "input", "sessionId": id, "data": "marker-4711\r"})
            .to_string()
            .into(),
    ))
    .await?;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "echo output never arrived"
        );
        let frame = next_json(&mut ws).await?;
        if frame["type"] == "output" && frame["data"].as_str().unwrap_or("").contains("marker-4711")
        {
            break;
        }
    }
    Ok(())
}

#[tokio::test]
async fn malformed_ws_message_answers_error_frame() -> anyhow::Result<()> {
    let corral = CorralProcess::start()?;
    corral.wait_healthy(TIMEOUT).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(corral.ws_url()).await?;
    let _sessions = next_json(&mut ws).await?;

    ws.send(Message::Text("not json at all".to_string().into())).await?;
    let frame = next_json(&mut ws).await?;
    assert_eq!(frame["type"], "error");

    // The connection is still usable afterwards.
    ws.send(Message::Text(
        serde_json::json!({"type": "unsubscribe", "sessionId": "deadbeef"})
            .to_string()
            .into(),
    ))
    .await?;
    Ok(())
}

async fn next_json<S>(
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
) -> anyhow::Result<serde_json::Value>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let deadline = Duration::from_secs(10);
    loop {
        let frame = tokio::time::timeout(deadline, ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("ws closed"))??;
        match frame {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => anyhow::bail!("unexpected frame: {other:?}"),
        }
    }
}

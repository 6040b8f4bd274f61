//! Player commands over the server's JSON-RPC control endpoint.
//!
//! Commands are not part of the Bayeux bus. Each one is a single POST of
//! `{"id":1,"method":"slim.request","params":[player, [words...]]}` and the
//! server answers with the same envelope plus a `result` object.

use std::fmt;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::ServerConfig;
use crate::error::{ClientError, Result};

/// Tags requested with every status query, covering what the status
/// decoder reads.
pub const STATUS_TAGS: &str = "tags:acdlJKNx";

/// A command addressed to one player.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Play,
    Pause,
    TogglePause,
    Stop,
    Next,
    Previous,
    /// Absolute volume, 0-100
    SetVolume(u8),
    /// Relative volume change
    AdjustVolume(i8),
    Power(bool),
    /// Jump to a position in the current track
    Seek(Duration),
    /// One-shot status query
    Status,
    /// Command words passed through as given
    Raw(Vec<String>),
}

impl PlayerCommand {
    /// The command words of the request.
    pub fn words(&self) -> Vec<String> {
        match self {
            PlayerCommand::Play => vec!["play".into()],
            PlayerCommand::Pause => vec!["pause".into(), "1".into()],
            PlayerCommand::TogglePause => vec!["pause".into()],
            PlayerCommand::Stop => vec!["stop".into()],
            PlayerCommand::Next => vec!["playlist".into(), "index".into(), "+1".into()],
            PlayerCommand::Previous => vec!["playlist".into(), "index".into(), "-1".into()],
            PlayerCommand::SetVolume(volume) => {
                vec!["mixer".into(), "volume".into(), (*volume).min(100).to_string()]
            }
            PlayerCommand::AdjustVolume(delta) => {
                vec!["mixer".into(), "volume".into(), format!("{:+}", delta)]
            }
            PlayerCommand::Power(on) => vec!["power".into(), if *on { "1" } else { "0" }.into()],
            PlayerCommand::Seek(position) => {
                vec!["time".into(), format!("{:.1}", position.as_secs_f64())]
            }
            PlayerCommand::Status => {
                vec!["status".into(), "-".into(), "1".into(), STATUS_TAGS.into()]
            }
            PlayerCommand::Raw(words) => words.clone(),
        }
    }

    /// Whether the result is a status payload for the decoder.
    pub fn is_status(&self) -> bool {
        match self {
            PlayerCommand::Status => true,
            PlayerCommand::Raw(words) => words.first().is_some_and(|w| w == "status"),
            _ => false,
        }
    }
}

impl fmt::Display for PlayerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.words().join(" "))
    }
}

/// The request envelope for `command` on `player`.
pub fn envelope(player: &str, command: &PlayerCommand) -> Value {
    json!({
        "id": 1,
        "method": "slim.request",
        "params": [player, command.words()],
    })
}

/// HTTP client for the control endpoint of one server.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    client: reqwest::Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
}

impl ControlChannel {
    pub fn new(server: &ServerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: server.control_url(),
            username: server.username.clone().filter(|u| !u.is_empty()),
            password: server.password.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send `command` to `player` and return the `result` object of the reply.
    pub async fn request(&self, player: &str, command: &PlayerCommand) -> Result<Value> {
        tracing::debug!(player, %command, "sending control request");

        let mut request = self.client.post(&self.url).json(&envelope(player, command));
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Control(format!(
                "{} returned HTTP {}",
                self.url,
                status.as_u16()
            )));
        }

        let mut body: Value = response.json().await?;
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(ClientError::Control(error.to_string()));
        }
        Ok(body
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PlayerCommand::Play, "play")]
    #[case(PlayerCommand::Pause, "pause 1")]
    #[case(PlayerCommand::TogglePause, "pause")]
    #[case(PlayerCommand::Next, "playlist index +1")]
    #[case(PlayerCommand::Previous, "playlist index -1")]
    #[case(PlayerCommand::SetVolume(140), "mixer volume 100")]
    #[case(PlayerCommand::AdjustVolume(5), "mixer volume +5")]
    #[case(PlayerCommand::AdjustVolume(-5), "mixer volume -5")]
    #[case(PlayerCommand::Power(false), "power 0")]
    #[case(PlayerCommand::Seek(Duration::from_millis(62_500)), "time 62.5")]
    #[case(PlayerCommand::Status, "status - 1 tags:acdlJKNx")]
    fn test_command_words(#[case] command: PlayerCommand, #[case] expected: &str) {
        assert_eq!(command.to_string(), expected);
    }

    #[test]
    fn test_envelope() {
        let value = envelope("00:04:20:aa:bb:cc", &PlayerCommand::Stop);
        assert_eq!(
            value,
            json!({"id": 1, "method": "slim.request", "params": ["00:04:20:aa:bb:cc", ["stop"]]})
        );
    }

    #[test]
    fn test_status_commands() {
        assert!(PlayerCommand::Status.is_status());
        assert!(PlayerCommand::Raw(vec!["status".into(), "0".into()]).is_status());
        assert!(!PlayerCommand::Play.is_status());
    }

    #[tokio::test]
    async fn test_request_returns_result() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/jsonrpc.js")
            .match_body(mockito::Matcher::PartialJson(json!({
                "method": "slim.request",
                "params": ["p1", ["play"]]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":1,"method":"slim.request","params":["p1",["play"]],"result":{}}"#)
            .create_async()
            .await;

        let control = ControlChannel::new(&server_for(&server));
        let result = control.request("p1", &PlayerCommand::Play).await.unwrap();
        assert_eq!(result, json!({}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/jsonrpc.js")
            .with_status(401)
            .create_async()
            .await;

        let control = ControlChannel::new(&server_for(&server));
        let error = control.request("p1", &PlayerCommand::Play).await.unwrap_err();
        assert!(matches!(error, ClientError::Control(message) if message.contains("401")));
    }

    fn server_for(server: &mockito::Server) -> ServerConfig {
        let address = server.host_with_port();
        let (host, port) = address.rsplit_once(':').unwrap();
        ServerConfig::new(host).with_port(port.parse().unwrap())
    }
}

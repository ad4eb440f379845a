//! # relay-cli
//!
//! Sidecar command for the hub's admin HTTP API: push broadcasts, inspect
//! clients and channels, kick connections, check health.

#![deny(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

/// CLI client for the socket server admin API.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Socket server CLI client")]
struct Cli {
    /// Socket server URL.
    #[arg(long, env = "SOCKET_SERVER_URL", default_value = "http://localhost:8080")]
    server: String,

    /// Admin API bearer token (required).
    #[arg(long, env = "HTTP_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a broadcast through the server.
    Send {
        /// Target channel.
        #[arg(long)]
        channel: Option<String>,
        /// Event name.
        #[arg(long, default_value = "broadcast")]
        event: String,
        /// Message data as a JSON value.
        #[arg(long, default_value = "null")]
        data: String,
        /// Broadcast type: channel, global, authenticated, user, user_except, client.
        #[arg(long = "type")]
        broadcast_type: Option<String>,
        /// Target user id (for user / user_except).
        #[arg(long)]
        user_id: Option<String>,
        /// Target client id (for client).
        #[arg(long)]
        client_id: Option<String>,
    },
    /// List connected clients.
    Clients,
    /// List channels.
    Channels,
    /// Kick a client by connection id.
    Kick { client_id: String },
    /// Check server health.
    Health,
}

struct AdminClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl AdminClient {
    fn new(base_url: String, token: String) -> Self {
        Self {
            base_url,
            token,
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;
        Self::parse(resp).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;
        Self::parse(resp).await
    }

    async fn parse(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .unwrap_or_else(|_| json!({"status": "error", "message": "non-JSON response"}));
        if !status.is_success() {
            bail!(
                "server returned {status}: {}",
                body["message"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(body)
    }
}

fn build_broadcast_body(
    channel: Option<String>,
    event: String,
    data: &str,
    broadcast_type: Option<String>,
    user_id: Option<String>,
    client_id: Option<String>,
) -> Result<Value> {
    let data: Value =
        serde_json::from_str(data).context("--data must be a valid JSON value")?;
    let mut body = json!({"event": event, "data": data});
    if let Some(channel) = channel {
        body["channel"] = json!(channel);
    }
    if let Some(t) = broadcast_type {
        body["broadcast_type"] = json!(t);
    }
    if let Some(user_id) = user_id {
        body["user_id"] = json!(user_id);
    }
    if let Some(client_id) = client_id {
        body["client_id"] = json!(client_id);
    }
    Ok(body)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Some(token) = cli.token else {
        bail!("admin token required: pass --token or set HTTP_TOKEN");
    };
    let client = AdminClient::new(cli.server.trim_end_matches('/').to_string(), token);

    let output = match cli.command {
        Command::Send {
            channel,
            event,
            data,
            broadcast_type,
            user_id,
            client_id,
        } => {
            let body =
                build_broadcast_body(channel, event, &data, broadcast_type, user_id, client_id)?;
            client.post("/broadcast", body).await?
        }
        Command::Clients => client.get("/clients").await?,
        Command::Channels => client.get("/channels").await?,
        Command::Kick { client_id } => {
            client
                .post(&format!("/clients/{client_id}/kick"), json!({}))
                .await?
        }
        Command::Health => client.get("/health").await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

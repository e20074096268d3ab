//! HTTP client for the node control surface.
//!
//! Routes, relative to a node's `control_endpoint`:
//!
//! | Call | Route |
//! |---|---|
//! | prepare | `POST runs/{graph}/{run_id}/prepare` with the sub-graph as JSON |
//! | start | `POST runs/{graph}/{run_id}/start` |
//! | status | `GET runs/{graph}/{run_id}/status` |
//! | stop | `POST runs/{graph}/{run_id}/stop` |
//! | next sequence block | `GET sequences/{name}/next?increment=N` |
//!
//! Connection failures, timeouts and 5xx answers map to transient
//! [`AgentError`]s; any other refusal maps to [`AgentError::Rejected`].

use crate::cluster::Node;
use crate::distributed::agent::{AgentError, AgentReply, NodeAgent, NodeRunStatus, RunScope, SequenceReply};
use crate::distributed::splitter::PhysicalSubgraph;
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

/// [`NodeAgent`] speaking HTTP/JSON to each node's agent server.
#[derive(Debug, Clone, Default)]
pub struct HttpNodeAgent {
  client: Client,
}

impl HttpNodeAgent {
  /// Creates an agent with a default client.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates an agent around a preconfigured client.
  pub fn with_client(client: Client) -> Self {
    Self { client }
  }

  fn url(&self, node: &Node, segments: &[&str]) -> Result<Url, AgentError> {
    let mut url = Url::parse(&node.control_endpoint).map_err(|e| {
      AgentError::Protocol(format!(
        "invalid control endpoint {}: {e}",
        node.control_endpoint
      ))
    })?;
    url
      .path_segments_mut()
      .map_err(|_| {
        AgentError::Protocol(format!(
          "control endpoint {} cannot carry a path",
          node.control_endpoint
        ))
      })?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn run_url(&self, node: &Node, scope: &RunScope, call: &str) -> Result<Url, AgentError> {
    self.url(node, &["runs", &scope.graph_name, &scope.run_id, call])
  }

  /// Allocates a block of `increment` values from a sequence served by
  /// `node` and returns the first value of the block.
  ///
  /// # Errors
  ///
  /// Returns [`AgentError::Rejected`] for unknown sequences and transient
  /// errors when the node is unreachable or its store is unavailable.
  pub async fn next_sequence_value(
    &self,
    node: &Node,
    name: &str,
    increment: i64,
  ) -> Result<i64, AgentError> {
    let url = self.url(node, &["sequences", name, "next"])?;
    let response = self
      .client
      .get(url)
      .query(&[("increment", increment)])
      .send()
      .await
      .map_err(transport_error)?;
    let reply: SequenceReply = decode(response).await?;
    Ok(reply.value)
  }

  async fn post_ack(&self, url: Url, body: Option<&PhysicalSubgraph>) -> Result<(), AgentError> {
    let mut request = self.client.post(url);
    if let Some(subgraph) = body {
      request = request.json(subgraph);
    }
    let response = request.send().await.map_err(transport_error)?;
    let reply: AgentReply = decode(response).await?;
    if reply.ok {
      Ok(())
    } else {
      Err(AgentError::Rejected(reply.message))
    }
  }
}

fn transport_error(e: reqwest::Error) -> AgentError {
  if e.is_timeout() {
    AgentError::Timeout
  } else if e.is_decode() {
    AgentError::Protocol(e.to_string())
  } else {
    AgentError::Unavailable(e.to_string())
  }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, AgentError> {
  let status = response.status();
  if status.is_success() {
    return response
      .json::<T>()
      .await
      .map_err(|e| AgentError::Protocol(e.to_string()));
  }

  let message = match response.json::<AgentReply>().await {
    Ok(reply) if !reply.message.is_empty() => reply.message,
    _ => status.to_string(),
  };
  if status.is_server_error() {
    Err(AgentError::Unavailable(message))
  } else {
    Err(AgentError::Rejected(message))
  }
}

#[async_trait]
impl NodeAgent for HttpNodeAgent {
  async fn prepare(
    &self,
    node: &Node,
    scope: &RunScope,
    subgraph: &PhysicalSubgraph,
  ) -> Result<(), AgentError> {
    debug!(node = %node.id, run_id = %scope.run_id, "Sending prepare");
    let url = self.run_url(node, scope, "prepare")?;
    self.post_ack(url, Some(subgraph)).await
  }

  async fn start(&self, node: &Node, scope: &RunScope) -> Result<(), AgentError> {
    debug!(node = %node.id, run_id = %scope.run_id, "Sending start");
    let url = self.run_url(node, scope, "start")?;
    self.post_ack(url, None).await
  }

  async fn status(&self, node: &Node, scope: &RunScope) -> Result<NodeRunStatus, AgentError> {
    let url = self.run_url(node, scope, "status")?;
    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(transport_error)?;
    decode(response).await
  }

  async fn stop(&self, node: &Node, scope: &RunScope) -> Result<(), AgentError> {
    debug!(node = %node.id, run_id = %scope.run_id, "Sending stop");
    let url = self.run_url(node, scope, "stop")?;
    self.post_ack(url, None).await
  }
}

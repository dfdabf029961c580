use std::sync::Arc;

use crate::messages::{NomadMessage, NomadResponse};
use crate::{NomadError, NomadServer, Result};

/// Message-dispatching wrapper around a server, as hosted behind a
/// transport. Takeover is not offered through this surface.
#[derive(Clone)]
pub struct NomadEntity {
    server: Arc<NomadServer>,
}

impl NomadEntity {
    pub fn new(server: Arc<NomadServer>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<NomadServer> {
        &self.server
    }

    pub async fn handle_message(&self, message: NomadMessage) -> Result<NomadResponse> {
        tracing::debug!("Node {} handling {} message", self.server.node_name(), message.kind());

        match message {
            NomadMessage::Discover => Ok(NomadResponse::Discover(self.server.discover().await?)),
            NomadMessage::Prepare(prepare) => {
                Ok(NomadResponse::AcceptReject(self.server.prepare(prepare).await?))
            }
            NomadMessage::Commit(commit) => {
                Ok(NomadResponse::AcceptReject(self.server.commit(commit).await?))
            }
            NomadMessage::Rollback(rollback) => {
                Ok(NomadResponse::AcceptReject(self.server.rollback(rollback).await?))
            }
            NomadMessage::Takeover(_) => Err(NomadError::Unsupported(
                "takeover is not available through the entity".to_string(),
            )),
        }
    }

    /// Decodes a JSON request, dispatches it and encodes the response.
    pub async fn handle_json(&self, request: &str) -> Result<String> {
        let message: NomadMessage = serde_json::from_str(request)?;
        let response = self.handle_message(message).await?;
        Ok(serde_json::to_string(&response)?)
    }
}

//! HTTP client for the key directory and conversation endpoints.

use async_trait::async_trait;
use courier::{ConversationDirectory, Error, KeyDirectory, KeyUpload, PreKeyBundle, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub struct HttpDirectory {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
}

#[derive(Serialize)]
struct DirectConversationRequest<'a> {
    peer_id: &'a str,
}

#[derive(Deserialize)]
struct DirectConversationResponse {
    conversation_id: String,
}

fn directory_error(e: impl std::fmt::Display) -> Error {
    Error::Directory(e.to_string())
}

impl HttpDirectory {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(directory_error)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(directory_error)?;
        debug!(status = %response.status(), url = %response.url(), "directory response");
        Ok(response)
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T> {
        response
            .error_for_status()
            .map_err(directory_error)?
            .json()
            .await
            .map_err(directory_error)
    }
}

#[async_trait]
impl KeyDirectory for HttpDirectory {
    async fn upload_keys(&self, upload: KeyUpload) -> Result<()> {
        let request = self.client.post(self.url(&["keys"])).json(&upload);
        self.send(request)
            .await?
            .error_for_status()
            .map_err(directory_error)?;
        Ok(())
    }

    async fn has_keys(&self, user_id: &str, device_id: u32, identity_key: &str) -> Result<bool> {
        let device = device_id.to_string();
        let request = self
            .client
            .get(self.url(&["keys", user_id, &device, "verify"]))
            .query(&[("identity_key", identity_key)]);
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Ok(Self::json::<VerifyResponse>(response).await?.valid)
    }

    async fn fetch_bundle(&self, user_id: &str, device_id: u32) -> Result<PreKeyBundle> {
        let device = device_id.to_string();
        let request = self.client.get(self.url(&["keys", user_id, &device]));
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NoPublishedKeys(format!("{}.{}", user_id, device_id)));
        }
        Self::json(response).await
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<u32>> {
        let request = self.client.get(self.url(&["users", user_id, "devices"]));
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Self::json(response).await
    }
}

#[async_trait]
impl ConversationDirectory for HttpDirectory {
    async fn create_or_get_direct(&self, _user_id: &str, peer_id: &str) -> Result<String> {
        // The server knows the caller from the bearer token
        let request = self
            .client
            .post(self.url(&["conversations", "direct"]))
            .json(&DirectConversationRequest { peer_id });
        let response = self.send(request).await?;
        Ok(Self::json::<DirectConversationResponse>(response)
            .await?
            .conversation_id)
    }
}

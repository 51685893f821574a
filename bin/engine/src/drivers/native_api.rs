use engine_client::entities::provider::{Provider, ProviderKind};
use engine_client::error::EngineError;
use reqwest::Client;

/// Thin wrapper over the per-backend native REST API (LXD/Incus's
/// unix/HTTPS API, Proxmox's `pvesh` HTTP API). Authentication is
/// either a client cert+key pair or a bearer-style API token,
/// whichever the provider's credentials carry.
pub struct NativeApiClient {
  client: Client,
  base_url: String,
  kind: ProviderKind,
  token: Option<(String, String)>,
}

impl NativeApiClient {
  pub fn build(provider: &Provider) -> anyhow::Result<Self> {
    let creds = &provider.config.credentials;
    let mut builder = Client::builder();

    if let (Some(cert), Some(key)) =
      (&creds.api_client_cert, &creds.api_client_key)
    {
      let identity = reqwest::Identity::from_pem(
        format!("{cert}\n{key}").as_bytes(),
      )?;
      builder = builder.identity(identity);
    }

    let client = builder.build()?;
    let token = match (&creds.api_token_id, &creds.api_token_secret) {
      (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
      _ => None,
    };

    Ok(Self {
      client,
      base_url: provider.config.endpoint.clone(),
      kind: provider.config.kind,
      token,
    })
  }

  fn authorize(
    &self,
    builder: reqwest::RequestBuilder,
  ) -> reqwest::RequestBuilder {
    match (&self.kind, &self.token) {
      (ProviderKind::Proxmox, Some((id, secret))) => {
        builder.header("Authorization", format!("PVEAPIToken={id}={secret}"))
      }
      (_, Some((id, secret))) => builder.bearer_auth(format!("{id}.{secret}")),
      _ => builder,
    }
  }

  pub async fn get(&self, path: &str) -> Result<serde_json::Value, EngineError> {
    let url = format!("{}{}", self.base_url, path);
    let request = self.authorize(self.client.get(&url));
    let response = request
      .send()
      .await
      .map_err(|e| EngineError::TransportApi(e.into()))?;
    response
      .json()
      .await
      .map_err(|e| EngineError::TransportApi(e.into()))
  }

  pub async fn post(
    &self,
    path: &str,
    body: &serde_json::Value,
  ) -> Result<serde_json::Value, EngineError> {
    let url = format!("{}{}", self.base_url, path);
    let request = self.authorize(self.client.post(&url).json(body));
    let response = request
      .send()
      .await
      .map_err(|e| EngineError::TransportApi(e.into()))?;
    response
      .json()
      .await
      .map_err(|e| EngineError::TransportApi(e.into()))
  }

  pub async fn put(
    &self,
    path: &str,
    body: &serde_json::Value,
  ) -> Result<serde_json::Value, EngineError> {
    let url = format!("{}{}", self.base_url, path);
    let request = self.authorize(self.client.put(&url).json(body));
    let response = request
      .send()
      .await
      .map_err(|e| EngineError::TransportApi(e.into()))?;
    response
      .json()
      .await
      .map_err(|e| EngineError::TransportApi(e.into()))
  }

  pub async fn delete(&self, path: &str) -> Result<serde_json::Value, EngineError> {
    let url = format!("{}{}", self.base_url, path);
    let request = self.authorize(self.client.delete(&url));
    let response = request
      .send()
      .await
      .map_err(|e| EngineError::TransportApi(e.into()))?;
    response
      .json()
      .await
      .map_err(|e| EngineError::TransportApi(e.into()))
  }

  pub async fn version(&self) -> Result<String, EngineError> {
    let path = match self.kind {
      ProviderKind::Lxd | ProviderKind::Incus => "/1.0",
      ProviderKind::Proxmox => "/api2/json/version",
      ProviderKind::Docker => "/version",
    };
    let value = self.get(path).await?;
    Ok(
      value
        .get("metadata")
        .or_else(|| value.get("data"))
        .unwrap_or(&value)
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string(),
    )
  }
}

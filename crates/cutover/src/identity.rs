// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resolution of the identity recorded as `DeployedBy` in history events.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::storage::S3Credentials;
use crate::storage::sigv4::{EMPTY_PAYLOAD_SHA256, Signer};

/// Source of the acting identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Name of whoever is performing the deployment.
    async fn current_user(&self) -> Result<String>;
}

/// Fixed identity, e.g. from `CUTOVER_DEPLOYED_BY`.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub String);

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

const IAM_ENDPOINT: &str = "https://iam.amazonaws.com/";

/// Asks IAM `GetUser` for the user owning the configured credentials.
#[derive(Debug, Clone)]
pub struct IamIdentity {
    http: reqwest::Client,
    endpoint: String,
    signer: Signer,
}

impl IamIdentity {
    /// Create a provider for the global IAM endpoint.
    pub fn new(credentials: S3Credentials) -> Self {
        Self::with_endpoint(IAM_ENDPOINT, credentials)
    }

    /// Create a provider for a custom endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>, credentials: S3Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            // IAM is a global service signed in us-east-1.
            signer: Signer::new(
                credentials.access_key_id,
                credentials.secret_access_key,
                credentials.session_token,
                "us-east-1",
                "iam",
            ),
        }
    }
}

#[async_trait]
impl IdentityProvider for IamIdentity {
    async fn current_user(&self) -> Result<String> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| Error::Identity(format!("invalid IAM endpoint: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("Action", "GetUser")
            .append_pair("Version", "2010-05-08");

        let headers = self
            .signer
            .sign("GET", &url, &[], EMPTY_PAYLOAD_SHA256, Utc::now())?;
        let mut request = self.http.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Identity(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Identity(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Identity(format!("[{}] {}", status.as_u16(), body)));
        }

        let user = user_name(&body)?;
        debug!(user = %user, "Resolved deployer identity");
        Ok(user)
    }
}

/// `GetUserResult/User/UserName` of a `GetUser` response.
fn user_name(xml: &str) -> Result<String> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| Error::Identity(format!("invalid GetUser response: {}", e)))?;

    child(doc.root_element(), "GetUserResult")
        .and_then(|result| child(result, "User"))
        .and_then(|user| child(user, "UserName"))
        .and_then(|name| name.text())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::Identity("no UserName in GetUser response".into()))
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GET_USER_RESPONSE: &str = r#"<GetUserResponse xmlns="https://iam.amazonaws.com/doc/2010-05-08/">
  <GetUserResult>
    <User>
      <UserId>AIDACKCEVSQ6C2EXAMPLE</UserId>
      <Path>/</Path>
      <UserName>deploy-bot</UserName>
      <Arn>arn:aws:iam::123456789012:user/deploy-bot</Arn>
    </User>
  </GetUserResult>
</GetUserResponse>"#;

    fn credentials() -> S3Credentials {
        S3Credentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        }
    }

    #[test]
    fn test_user_name() {
        assert_eq!(user_name(GET_USER_RESPONSE).unwrap(), "deploy-bot");
    }

    #[test]
    fn test_user_name_decodes_entities() {
        let xml = GET_USER_RESPONSE.replace("deploy-bot</UserName>", "a&amp;b</UserName>");
        assert_eq!(user_name(&xml).unwrap(), "a&b");
    }

    #[test]
    fn test_user_name_only_under_user() {
        let xml = r#"<GetUserResponse xmlns="https://iam.amazonaws.com/doc/2010-05-08/">
  <ResponseMetadata><UserName>not-me</UserName></ResponseMetadata>
  <GetUserResult><User><UserId>AIDA</UserId></User></GetUserResult>
</GetUserResponse>"#;
        assert!(matches!(user_name(xml), Err(Error::Identity(_))));
    }

    #[test]
    fn test_user_name_rejects_malformed_xml() {
        let err = user_name("<GetUserResponse><UserName>x</GetUserResponse>").unwrap_err();
        assert!(matches!(err, Error::Identity(ref m) if m.contains("invalid GetUser response")));
    }

    #[tokio::test]
    async fn test_static_identity() {
        let id = StaticIdentity("ops".into());
        assert_eq!(id.current_user().await.unwrap(), "ops");
    }

    #[tokio::test]
    async fn test_iam_get_user() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(query_param("Action", "GetUser"))
            .and(query_param("Version", "2010-05-08"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GET_USER_RESPONSE))
            .mount(&mock_server)
            .await;

        let provider = IamIdentity::with_endpoint(format!("{}/", mock_server.uri()), credentials());
        assert_eq!(provider.current_user().await.unwrap(), "deploy-bot");
    }

    #[tokio::test]
    async fn test_iam_error_surfaces() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("AccessDenied"))
            .mount(&mock_server)
            .await;

        let provider = IamIdentity::with_endpoint(mock_server.uri(), credentials());
        let err = provider.current_user().await.unwrap_err();
        assert!(matches!(err, Error::Identity(ref m) if m.contains("403")));
    }
}

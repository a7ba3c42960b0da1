use std::{sync::Arc, time::Duration};

use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    multipart::{Form, Part},
    Client, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::error::{ApiError, ErrorCode};
use tracing::{debug, warn};
use url::Url;

use crate::{
    credentials::CredentialStore, error::GatewayError, refresh::RefreshCoordinator,
};

/// Joins a base url and an endpoint path without dropping the base path.
pub(crate) fn endpoint_url(base_url: &str, path: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

impl MultipartPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            mime_type: None,
            data: value.into().into_bytes(),
        }
    }

    pub fn file(
        name: impl Into<String>,
        filename: impl Into<String>,
        mime_type: Option<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            filename: Some(filename.into()),
            mime_type,
            data,
        }
    }
}

/// Request body kept in a form that can be sent again on retry.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Bytes {
        content_type: String,
        data: Vec<u8>,
    },
    Multipart(Vec<MultipartPart>),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: RequestBody,
    authenticated: bool,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            authenticated: true,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, GatewayError> {
        let value =
            serde_json::to_value(body).map_err(|err| GatewayError::Encode(err.to_string()))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn bytes(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.body = RequestBody::Bytes {
            content_type: content_type.into(),
            data,
        };
        self
    }

    pub fn multipart(mut self, parts: Vec<MultipartPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    /// Never attach a bearer token and never enter the refresh path (login, public pages).
    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        serde_json::from_slice(&self.body).map_err(|err| GatewayError::Decode(err.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Entry point for every outbound API call.
pub struct RequestGateway {
    http: Client,
    base_url: String,
    timeout: Duration,
    store: Arc<CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
}

impl RequestGateway {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        timeout: Duration,
        store: Arc<CredentialStore>,
        refresh: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout,
            store,
            refresh,
        }
    }

    /// Sends `request`, refreshing the credential and retrying once on 401.
    pub async fn execute(&self, mut request: ApiRequest) -> Result<ApiResponse, GatewayError> {
        let mut token = if request.authenticated {
            self.store.access_token().await
        } else {
            None
        };
        loop {
            let response = self.send_once(&request, token.as_deref()).await?;
            if response.status != StatusCode::UNAUTHORIZED || !request.authenticated {
                return into_result(response);
            }
            if request.retried {
                warn!(path = %request.path, "gateway: retried request still unauthorized");
                return Err(GatewayError::AuthExpired);
            }

            request.retried = true;
            debug!(
                method = %request.method,
                path = %request.path,
                "gateway: authorization rejected, refreshing credential"
            );
            match self.refresh.refresh_after(token.as_deref()).await {
                Ok(fresh) => token = Some(fresh),
                Err(err) => {
                    warn!(path = %request.path, error = %err, "gateway: session expired");
                    return Err(GatewayError::SessionExpired(err));
                }
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        self.execute(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        self.execute(ApiRequest::post(path).json(body)?)
            .await?
            .json()
    }

    async fn send_once(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<ApiResponse, GatewayError> {
        let url = endpoint_url(&self.base_url, &request.path)
            .map_err(|err| GatewayError::InvalidUrl(format!("{}: {err}", request.path)))?;
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .timeout(self.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Bytes { content_type, data } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
            RequestBody::Multipart(parts) => builder.multipart(build_form(parts)?),
        };

        let res = builder
            .send()
            .await
            .map_err(|err| GatewayError::Transient(err.to_string()))?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res
            .bytes()
            .await
            .map_err(|err| GatewayError::Transient(err.to_string()))?
            .to_vec();
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

fn build_form(parts: &[MultipartPart]) -> Result<Form, GatewayError> {
    let mut form = Form::new();
    for part in parts {
        let mut body = Part::bytes(part.data.clone());
        if let Some(filename) = &part.filename {
            body = body.file_name(filename.clone());
        }
        if let Some(mime_type) = &part.mime_type {
            body = body
                .mime_str(mime_type)
                .map_err(|err| GatewayError::Encode(err.to_string()))?;
        }
        form = form.part(part.name.clone(), body);
    }
    Ok(form)
}

fn into_result(response: ApiResponse) -> Result<ApiResponse, GatewayError> {
    if response.status.is_success() {
        return Ok(response);
    }
    let status = response.status.as_u16();
    let (code, message) = match serde_json::from_slice::<ApiError>(&response.body) {
        Ok(body) => (body.code, body.message),
        Err(_) => {
            let text = response.text();
            let message = if text.trim().is_empty() {
                response
                    .status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                text
            };
            (ErrorCode::from_status(status), message)
        }
    };
    Err(GatewayError::Api {
        status,
        code,
        message,
    })
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;

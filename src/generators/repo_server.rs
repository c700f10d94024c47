//! gRPC client for the Argo CD repository server
//!
//! Only the two unary calls the Git generator needs are implemented. Message
//! types are declared with prost derives and mirror the field numbers of
//! `reposerver/repository/repository.proto`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::debug;

use super::git::RepoService;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

const GET_GIT_DIRECTORIES: &str = "/repository.RepoServerService/GetGitDirectories";
const GET_GIT_FILES: &str = "/repository.RepoServerService/GetGitFiles";

/// Repository coordinates
#[derive(Clone, PartialEq, prost::Message)]
pub struct Repository {
    /// Repository URL
    #[prost(string, tag = "1")]
    pub repo: String,
}

/// Request for every directory at a revision
#[derive(Clone, PartialEq, prost::Message)]
pub struct GitDirectoriesRequest {
    /// Repository to read
    #[prost(message, optional, tag = "1")]
    pub repo: Option<Repository>,
    /// Recurse into submodules
    #[prost(bool, tag = "2")]
    pub submodule_enabled: bool,
    /// Branch, tag or commit
    #[prost(string, tag = "3")]
    pub revision: String,
}

/// Repository-relative directory paths
#[derive(Clone, PartialEq, prost::Message)]
pub struct GitDirectoriesResponse {
    /// Directory paths
    #[prost(string, repeated, tag = "1")]
    pub paths: Vec<String>,
}

/// Request for the contents of files matching a glob
#[derive(Clone, PartialEq, prost::Message)]
pub struct GitFilesRequest {
    /// Repository to read
    #[prost(message, optional, tag = "1")]
    pub repo: Option<Repository>,
    /// Recurse into submodules
    #[prost(bool, tag = "2")]
    pub submodule_enabled: bool,
    /// Branch, tag or commit
    #[prost(string, tag = "3")]
    pub revision: String,
    /// Glob of files to return
    #[prost(string, tag = "4")]
    pub path: String,
    /// Use `**`-aware globbing
    #[prost(bool, tag = "5")]
    pub new_git_file_globbing_enabled: bool,
}

/// File path to file contents
#[derive(Clone, PartialEq, prost::Message)]
pub struct GitFilesResponse {
    /// Matched files
    #[prost(map = "string, bytes", tag = "1")]
    pub map: HashMap<String, Vec<u8>>,
}

/// Repository server client over a lazily connected tonic channel
#[derive(Clone)]
pub struct GrpcRepoService {
    inner: Grpc<Channel>,
    retry: RetryConfig,
}

impl GrpcRepoService {
    /// Build a client for `addr`.
    ///
    /// At most `max_connections` requests are in flight at once and each
    /// call is bounded by `timeout`. The connection is established on first
    /// use, so this must be called from within a tokio runtime.
    pub fn connect_lazy(
        addr: &str,
        max_connections: usize,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let channel = Endpoint::from_shared(addr.to_string())
            .map_err(|e| Error::repo_server(format!("invalid address {addr}: {e}")))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .concurrency_limit(max_connections.max(1))
            .connect_lazy();

        Ok(Self {
            inner: Grpc::new(channel),
            retry: RetryConfig::default(),
        })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, Error>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        retry_with_backoff(&self.retry, path, Error::is_transient, || {
            let mut grpc = self.inner.clone();
            let request = request.clone();
            async move {
                grpc.ready()
                    .await
                    .map_err(|e| Error::repo_server(format!("repository server not ready: {e}")))?;
                let codec: ProstCodec<Req, Resp> = ProstCodec::default();
                let response = grpc
                    .unary(
                        tonic::Request::new(request),
                        http::uri::PathAndQuery::from_static(path),
                        codec,
                    )
                    .await
                    .map_err(status_error)?;
                Ok::<Resp, Error>(response.into_inner())
            }
        })
        .await
    }
}

/// Infrastructure failures are retryable; everything else is the generator's fault
fn status_error(status: tonic::Status) -> Error {
    match status.code() {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::Internal
        | Code::Unknown => Error::repo_server(format!("{:?}: {}", status.code(), status.message())),
        _ => Error::generator("git", status.message().to_string()),
    }
}

#[async_trait]
impl RepoService for GrpcRepoService {
    async fn list_directories(&self, repo_url: &str, revision: &str) -> Result<Vec<String>, Error> {
        let response: GitDirectoriesResponse = self
            .unary(
                GET_GIT_DIRECTORIES,
                GitDirectoriesRequest {
                    repo: Some(Repository {
                        repo: repo_url.to_string(),
                    }),
                    submodule_enabled: false,
                    revision: revision.to_string(),
                },
            )
            .await?;

        debug!(repo = repo_url, revision, count = response.paths.len(), "listed directories");
        Ok(response.paths)
    }

    async fn get_files(
        &self,
        repo_url: &str,
        revision: &str,
        pattern: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        let response: GitFilesResponse = self
            .unary(
                GET_GIT_FILES,
                GitFilesRequest {
                    repo: Some(Repository {
                        repo: repo_url.to_string(),
                    }),
                    submodule_enabled: false,
                    revision: revision.to_string(),
                    path: pattern.to_string(),
                    new_git_file_globbing_enabled: true,
                },
            )
            .await?;

        debug!(repo = repo_url, revision, pattern, count = response.map.len(), "fetched files");
        Ok(response.map.into_iter().collect())
    }
}

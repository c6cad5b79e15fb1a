//! Provider adapters for Tern Mail
//!
//! Each supported mail API implements [`MailProvider`]. Adapters are created
//! per run with a fresh access token through a [`ProviderFactory`].

pub mod aurinko;
pub mod compose;
pub mod executor;
pub mod gmail;
pub mod graph;

use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::account::ProviderKind;
use crate::config::Config;
use crate::error::{TernError, TernResult};
use crate::message::{EmailMessage, SendParams, SentMessage};

pub use aurinko::AurinkoProvider;
pub use executor::{RequestExecutor, RetryPolicy, Sleeper, TokioSleeper};
pub use gmail::GmailProvider;
pub use graph::GraphProvider;

/// Mailbox owner as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub email: String,
    pub display_name: Option<String>,
}

/// One page request.
///
/// `cursor` is the resting delta token of the last completed run, `None` for a
/// bootstrap. `page_token` continues a run that already fetched earlier pages.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Provider search query, honored by providers that support one
    pub query: Option<String>,
    pub page_token: Option<String>,
    pub cursor: Option<String>,
    pub page_size: u32,
    /// Start of the bootstrap window
    pub since: Option<OffsetDateTime>,
}

/// One page of fully detailed, normalized messages
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<EmailMessage>,
    /// Present while more pages remain in this run
    pub next_page_token: Option<String>,
    /// Delta token announced by the provider for the next run
    pub next_cursor: Option<String>,
    /// Messages dropped because they could not be normalized
    pub malformed: usize,
}

/// Capabilities every provider adapter offers
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn get_profile(&self) -> TernResult<Profile>;

    async fn list_messages(&self, request: &ListRequest) -> TernResult<MessagePage>;

    async fn get_message_detail(&self, id: &str) -> TernResult<EmailMessage>;

    async fn send_message(&self, params: &SendParams) -> TernResult<SentMessage>;
}

/// Creates adapters bound to an access token
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind, access_token: &str) -> TernResult<Arc<dyn MailProvider>>;
}

/// API base URLs of the HTTP adapters
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub gmail: String,
    pub graph: String,
    pub aurinko: String,
}

impl ProviderEndpoints {
    pub fn from_config(config: &Config) -> Self {
        Self {
            gmail: config.providers.gmail_api_base.clone(),
            graph: config.providers.graph_api_base.clone(),
            aurinko: config.providers.aurinko_api_base.clone(),
        }
    }
}

/// Factory for the real HTTP adapters
#[derive(Clone)]
pub struct HttpProviderFactory {
    executor: RequestExecutor,
    endpoints: ProviderEndpoints,
}

impl HttpProviderFactory {
    pub fn new(config: &Config) -> TernResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("{}/{}", crate::APP_NAME.replace(' ', "-"), crate::VERSION))
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        let executor = RequestExecutor::new(
            client,
            RetryPolicy::from_config(&config.sync),
            Arc::new(TokioSleeper),
        );
        Ok(Self::with_executor(executor, ProviderEndpoints::from_config(config)))
    }

    pub fn with_executor(executor: RequestExecutor, endpoints: ProviderEndpoints) -> Self {
        Self { executor, endpoints }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, kind: ProviderKind, access_token: &str) -> TernResult<Arc<dyn MailProvider>> {
        if access_token.is_empty() {
            return Err(TernError::auth_expired("No access token available"));
        }

        let provider: Arc<dyn MailProvider> = match kind {
            ProviderKind::Google => Arc::new(GmailProvider::new(
                self.executor.clone(),
                &self.endpoints.gmail,
                access_token,
            )?),
            ProviderKind::Microsoft => Arc::new(GraphProvider::new(
                self.executor.clone(),
                &self.endpoints.graph,
                access_token,
            )?),
            ProviderKind::Aurinko => Arc::new(AurinkoProvider::new(
                self.executor.clone(),
                &self.endpoints.aurinko,
                access_token,
            )?),
        };
        Ok(provider)
    }
}

/// Join a base URL and a path without doubling slashes
pub(crate) fn join_url(base: &url::Url, path: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), path.trim_start_matches('/'))
}

//! Cloud runtime backend (Bedrock `InvokeModel` and
//! `InvokeModelWithResponseStream`) for premium organizations.

use std::error::Error as StdError;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_bedrockruntime::config::Credentials;
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use aws_sdk_bedrockruntime::Client;
use futures_util::{Stream, StreamExt};
use secrecy::ExposeSecret;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use deckhand_core::config::BedrockConfig;
use deckhand_core::domain::organization::ProviderId;

use super::anthropic::{MessagesRequest, MessagesResponse};
use super::stream::{MessagesEventDecoder, StreamEvent};
use super::{
    ChatMessage, Completion, CompletionOptions, CompletionStream, LlmError, LlmProvider,
    ProviderMetadata,
};

pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const CREDENTIALS_SOURCE: &str = "deckhand-config";

pub struct BedrockProvider {
    config: BedrockConfig,
    timeout: Duration,
    client: OnceCell<Client>,
}

impl BedrockProvider {
    pub fn new(config: BedrockConfig, timeout: Duration) -> Self {
        Self { config, timeout, client: OnceCell::new() }
    }

    fn region(&self) -> Option<&str> {
        self.config.region.as_deref().map(str::trim).filter(|region| !region.is_empty())
    }

    fn credentials(&self) -> Result<(Credentials, String), LlmError> {
        let secret = |value: &Option<secrecy::SecretString>| {
            value
                .as_ref()
                .map(|secret| secret.expose_secret().trim().to_string())
                .filter(|secret| !secret.is_empty())
        };
        let missing = |what: &str| LlmError::Authentication {
            provider_id: ProviderId::Bedrock,
            message: format!("{what} is not configured"),
        };

        let region = self.region().ok_or_else(|| missing("region"))?.to_string();
        let access_key_id =
            secret(&self.config.access_key_id).ok_or_else(|| missing("access key id"))?;
        let secret_access_key =
            secret(&self.config.secret_access_key).ok_or_else(|| missing("secret access key"))?;
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            secret(&self.config.session_token),
            None,
            CREDENTIALS_SOURCE,
        );
        Ok((credentials, region))
    }

    /// The SDK client is built on first use; credentials are checked on every call.
    async fn client(&self) -> Result<&Client, LlmError> {
        let (credentials, region) = self.credentials()?;
        let endpoint_url = self
            .config
            .endpoint_url
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(str::to_string);

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(self.timeout.min(Duration::from_secs(10)))
            .read_timeout(self.timeout)
            .build();

        let client = self
            .client
            .get_or_init(|| async move {
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(region))
                    .credentials_provider(credentials)
                    .timeout_config(timeouts);
                if let Some(endpoint_url) = endpoint_url {
                    loader = loader.endpoint_url(endpoint_url);
                }
                Client::new(&loader.load().await)
            })
            .await;
        Ok(client)
    }

    fn request_body(
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Blob, LlmError> {
        let mut request = MessagesRequest::new(system_prompt, messages, options);
        request.anthropic_version = Some(BEDROCK_ANTHROPIC_VERSION);
        serde_json::to_vec(&request).map(Blob::new).map_err(|error| LlmError::Provider {
            provider_id: ProviderId::Bedrock,
            message: format!("could not encode request: {error}"),
            code: None,
            retryable: false,
        })
    }

    fn log_request(&self, streaming: bool) {
        debug!(
            event_name = "llm.request.sent",
            provider = %ProviderId::Bedrock,
            model = %self.config.model_id,
            region = self.region().unwrap_or_default(),
            stream = streaming,
            "sending runtime invoke request"
        );
    }
}

fn log_failure(error: &LlmError) {
    warn!(
        event_name = "llm.request.failed",
        provider = %ProviderId::Bedrock,
        error_class = error.error_class(),
        error = %error,
        "runtime invoke request failed"
    );
}

/// Maps a runtime exception name such as `ThrottlingException`. Unknown names
/// fall back to classification by wording.
pub(crate) fn error_for_exception(error_type: &str, message: String) -> LlmError {
    let provider_id = ProviderId::Bedrock;
    let name = error_type.split(':').next().unwrap_or(error_type).trim();
    let code = Some(name.to_string());

    match name {
        "ThrottlingException" | "TooManyRequestsException" | "ServiceQuotaExceededException" => {
            LlmError::RateLimited { provider_id, retry_after_ms: None }
        }
        "AccessDeniedException"
        | "UnrecognizedClientException"
        | "ExpiredTokenException"
        | "InvalidSignatureException"
        | "IncompleteSignatureException"
        | "MissingAuthenticationTokenException" => LlmError::Authentication { provider_id, message },
        "ModelTimeoutException"
        | "ServiceUnavailableException"
        | "InternalServerException"
        | "ModelNotReadyException"
        | "ModelStreamErrorException" => LlmError::Provider { provider_id, message, code, retryable: true },
        "ValidationException" | "ResourceNotFoundException" | "ModelErrorException" => {
            LlmError::Provider { provider_id, message, code, retryable: false }
        }
        _ => LlmError::classify(provider_id, message, code, false),
    }
}

/// Normalizes an SDK failure. Service errors are mapped by exception name;
/// transport failures and timeouts are retryable.
pub(crate) fn sdk_error<E, R>(error: SdkError<E, R>) -> LlmError
where
    E: ProvideErrorMetadata + StdError + 'static,
    R: Debug,
{
    let provider_id = ProviderId::Bedrock;
    match &error {
        SdkError::ServiceError(service) => {
            let exception = service.err();
            let name = exception.code().unwrap_or("UnknownException").to_string();
            let message = exception
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&error).to_string());
            error_for_exception(&name, message)
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            LlmError::Provider {
                provider_id,
                message: DisplayErrorContext(&error).to_string(),
                code: None,
                retryable: true,
            }
        }
        _ => LlmError::classify(provider_id, DisplayErrorContext(&error).to_string(), None, false),
    }
}

fn malformed(message: String) -> StreamEvent {
    StreamEvent::Error {
        error: LlmError::Provider { provider_id: ProviderId::Bedrock, message, code: None, retryable: false },
    }
}

/// Turns `chunk` payloads (Anthropic stream events as JSON) into stream
/// events, ending at the first terminal one. The SDK has already verified the
/// eventstream frames and decoded the base64 body.
pub(crate) fn chunk_events<S>(chunks: S) -> impl Stream<Item = StreamEvent> + Send + 'static
where
    S: Stream<Item = Result<Vec<u8>, LlmError>> + Send + 'static,
{
    async_stream::stream! {
        let mut chunks = Box::pin(chunks);
        let mut decoder = MessagesEventDecoder::new(ProviderId::Bedrock);

        while let Some(chunk) = chunks.next().await {
            let event = match chunk {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => decoder.decode(&text),
                    Err(_) => Some(malformed("chunk bytes are not UTF-8".to_string())),
                },
                Err(error) => Some(StreamEvent::Error { error }),
            };
            if let Some(event) = event {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl LlmProvider for BedrockProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Bedrock
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "Amazon Bedrock".to_string(),
            model: self.config.model_id.clone(),
            supports_streaming: true,
            supports_system_prompt: true,
            max_context_tokens: self.config.max_context_tokens,
            region: self.region().map(str::to_string),
        }
    }

    fn is_available(&self) -> bool {
        self.config.has_credentials()
    }

    async fn generate_completion(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let body = Self::request_body(system_prompt, messages, options)?;
        let client = self.client().await?;
        self.log_request(false);

        let output = client
            .invoke_model()
            .model_id(&self.config.model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(body)
            .send()
            .await
            .map_err(|error| {
                let error = sdk_error(error);
                log_failure(&error);
                error
            })?;

        let parsed: MessagesResponse =
            serde_json::from_slice(output.body().as_ref()).map_err(|error| LlmError::Provider {
                provider_id: ProviderId::Bedrock,
                message: format!("unreadable invoke response: {error}"),
                code: None,
                retryable: false,
            })?;
        Ok(parsed.into_completion())
    }

    async fn stream_completion(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> CompletionStream {
        let body = match Self::request_body(system_prompt, messages, options) {
            Ok(body) => body,
            Err(error) => return CompletionStream::failed(error),
        };
        let client = match self.client().await {
            Ok(client) => client,
            Err(error) => return CompletionStream::failed(error),
        };
        self.log_request(true);

        let output = match client
            .invoke_model_with_response_stream()
            .model_id(&self.config.model_id)
            .content_type("application/json")
            .body(body)
            .send()
            .await
        {
            Ok(output) => output,
            Err(error) => {
                let error = sdk_error(error);
                log_failure(&error);
                return CompletionStream::failed(error);
            }
        };

        let mut receiver = output.body;
        let chunks = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        if let Some(bytes) = part.bytes() {
                            yield Ok(bytes.as_ref().to_vec());
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return,
                    Err(error) => {
                        yield Err(sdk_error(error));
                        return;
                    }
                }
            }
        };
        CompletionStream::new(ProviderId::Bedrock, chunk_events(chunks))
    }
}

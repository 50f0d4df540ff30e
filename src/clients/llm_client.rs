//! 模型服务客户端
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 豆包（Ark）与通义（DashScope）均走 OpenAI 兼容接口
//! - 识图与文本批改共用同一个客户端，按服务商选择模型

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImage, ChatCompletionRequestMessageContentPartText,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ProviderError;
use crate::models::{ChatMessage, ChatRole, LlmProvider, VisionProvider};

/// 流式输出的增量文本
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// 识图服务：图片 → 文本
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn analyze(
        &self,
        provider: VisionProvider,
        image_urls: &[String],
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError>;
}

/// 文本推理服务：批改（一次性）与辅导（流式）
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(
        &self,
        provider: LlmProvider,
        system_message: &str,
        user_message: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError>;

    async fn stream(
        &self,
        provider: LlmProvider,
        messages: &[ChatMessage],
    ) -> Result<TokenStream, ProviderError>;
}

/// OpenAI 兼容接口的实现
pub struct OpenAiBackend {
    doubao: Client<OpenAIConfig>,
    qwen: Client<OpenAIConfig>,
    config: Config,
}

impl OpenAiBackend {
    pub fn new(config: &Config) -> Self {
        let build = |provider: LlmProvider| {
            let endpoint = config.endpoint(provider);
            let openai_config = OpenAIConfig::new()
                .with_api_key(&endpoint.api_key)
                .with_api_base(&endpoint.api_base_url);
            Client::with_config(openai_config)
        };

        Self {
            doubao: build(LlmProvider::Doubao),
            qwen: build(LlmProvider::Qwen),
            config: config.clone(),
        }
    }

    fn client(&self, provider: LlmProvider) -> &Client<OpenAIConfig> {
        match provider {
            LlmProvider::Doubao => &self.doubao,
            LlmProvider::Qwen => &self.qwen,
        }
    }

    async fn create(
        &self,
        provider: LlmProvider,
        model: &str,
        messages: Vec<ChatCompletionRequestMessage>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .temperature(0.2)
            .max_tokens(max_tokens)
            .build()
            .map_err(map_openai_error)?;

        let chat = self.client(provider).chat();
        let call = chat.create(request);
        let response = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("模型 API 调用失败 ({}): {}", model, e);
                return Err(map_openai_error(e));
            }
            Err(_) => {
                warn!("模型 API 调用超时 ({}): {:?}", model, timeout);
                return Err(ProviderError::Timeout(timeout.as_millis() as u64));
            }
        };

        debug!("模型 API 调用成功 ({})", model);

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ProviderError::EmptyContent(model.to_string()))
    }
}

#[async_trait]
impl VisionBackend for OpenAiBackend {
    async fn analyze(
        &self,
        provider: VisionProvider,
        image_urls: &[String],
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let endpoint = provider.endpoint();
        let model = self.config.endpoint(endpoint).vision_model.clone();
        debug!("调用识图 API，模型: {}，图片 {} 张", model, image_urls.len());

        let mut content_parts: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();
        content_parts.push(ChatCompletionRequestUserMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartText {
                text: prompt.to_string(),
            },
        ));
        for url in image_urls {
            content_parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: url.clone(),
                        detail: Some(ImageDetail::High),
                    },
                },
            ));
        }

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()
            .map_err(map_openai_error)?;

        self.create(
            endpoint,
            &model,
            vec![ChatCompletionRequestMessage::User(user_msg)],
            4096,
            timeout,
        )
        .await
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(
        &self,
        provider: LlmProvider,
        system_message: &str,
        user_message: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let model = self.config.endpoint(provider).llm_model.clone();
        debug!("调用批改 API，模型: {}，输入 {} 字符", model, user_message.len());

        let messages = to_request_messages(&[
            ChatMessage {
                role: ChatRole::System,
                content: system_message.to_string(),
            },
            ChatMessage::user(user_message),
        ])?;

        self.create(provider, &model, messages, 4096, timeout).await
    }

    async fn stream(
        &self,
        provider: LlmProvider,
        messages: &[ChatMessage],
    ) -> Result<TokenStream, ProviderError> {
        let model = self.config.endpoint(provider).llm_model.clone();
        debug!("调用辅导流式 API，模型: {}，消息 {} 条", model, messages.len());

        let request = CreateChatCompletionRequestArgs::default()
            .model(&model)
            .messages(to_request_messages(messages)?)
            .temperature(0.5)
            .max_tokens(2048u32)
            .stream(true)
            .build()
            .map_err(map_openai_error)?;

        let stream = self
            .client(provider)
            .chat()
            .create_stream(request)
            .await
            .map_err(map_openai_error)?;

        let mapped = stream.map(|chunk| match chunk {
            Ok(response) => Ok(response
                .choices
                .first()
                .and_then(|choice| choice.delta.content.clone())
                .unwrap_or_default()),
            Err(e) => Err(map_openai_error(e)),
        });

        Ok(Box::pin(mapped))
    }
}

fn to_request_messages(
    messages: &[ChatMessage],
) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
    messages
        .iter()
        .map(|message| {
            let built = match message.role {
                ChatRole::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(message.content.as_str())
                        .build()?,
                ),
                ChatRole::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(message.content.as_str())
                        .build()?,
                ),
                ChatRole::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(message.content.as_str())
                        .build()?,
                ),
            };
            Ok(built)
        })
        .collect::<Result<Vec<_>, OpenAIError>>()
        .map_err(map_openai_error)
}

fn map_openai_error(err: OpenAIError) -> ProviderError {
    match err {
        OpenAIError::Reqwest(e) => ProviderError::Transport(e.to_string()),
        other => ProviderError::Api(other.to_string()),
    }
}

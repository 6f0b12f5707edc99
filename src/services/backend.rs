//! 提取后端 - 业务能力层
//!
//! 只负责"把页面文本变成回复文本"这一件事，不解析、不过滤、不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult, BackendError};

/// 一次自然语言提取请求
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// 提取任务描述（来自目标配置）
    pub task: String,
    /// 清洗并截断后的页面文本
    pub page_text: String,
    /// 上一页的补充语境（翻页门户用，可省）
    pub prior_context: Option<String>,
}

/// 自然语言提取能力的窄契约
///
/// 返回原始回复文本；解析和可信度过滤在上层做。
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> AppResult<String>;

    /// 标识字符串，进日志和取证记录
    fn describe(&self) -> String;
}

/// 生产实现：OpenAI 兼容端点
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    model_name: String,
}

impl OpenAiBackend {
    pub fn new(config: &Config) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        let client = Client::with_config(openai_config);

        Self {
            client,
            model_name: config.llm_model_name.clone(),
        }
    }

    /// 通用的 LLM 调用函数
    ///
    /// 最基础的调用接口，所有提取请求最终都落到这里。
    pub async fn send_to_llm(
        &self,
        user_message: &str,
        system_message: Option<&str>,
    ) -> AppResult<String> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", user_message.len());

        let mut messages = Vec::new();

        if let Some(sys_msg) = system_message {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg)
                .build()
                .map_err(|e| AppError::backend_call_failed(&self.model_name, e))?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(|e| AppError::backend_call_failed(&self.model_name, e))?;
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        // 低温度；输出上限按整页提取的最大体量给
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.3)
            .max_tokens(4096u32)
            .build()
            .map_err(|e| AppError::backend_call_failed(&self.model_name, e))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            AppError::backend_call_failed(&self.model_name, e)
        })?;

        debug!("LLM API 调用成功");

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| {
                AppError::Backend(BackendError::EmptyResponse {
                    model: self.model_name.clone(),
                })
            })?;

        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl ExtractionBackend for OpenAiBackend {
    async fn extract(&self, request: &ExtractionRequest) -> AppResult<String> {
        let (user_message, system_message) = build_extraction_messages(request);
        self.send_to_llm(&user_message, Some(&system_message)).await
    }

    fn describe(&self) -> String {
        format!("openai:{}", self.model_name)
    }
}

/// 构建提取消息，返回 (user_message, system_message)
///
/// 提示词用英文：目标门户全部是英文页面。
fn build_extraction_messages(request: &ExtractionRequest) -> (String, String) {
    let system_message = "You are a data extraction assistant for municipal building \
         permit portals. You read raw page text and return ONLY valid JSON, with no \
         commentary and no markdown fences. Extract only what is actually present on \
         the page; never invent, pad, or guess values."
        .to_string();

    let prior = match &request.prior_context {
        Some(p) if !p.is_empty() => format!("\nContext from the previous page:\n{}\n", p),
        _ => String::new(),
    };

    let user_message = format!(
        r#"Task: {task}

Below is the visible text of one results page from a municipal permit portal.
Extract every permit record you can find into a JSON object of the form:

  {{"permits": [{{"permit_id": "...", "address": "...", "category": "...", "status": "...", "date": "...", "description": "..."}}]}}

Rules:
- Include a field only when its value actually appears in the text.
- Keep values verbatim; do not normalize or reformat.
- If the page contains no permit records, return {{"permits": []}}.
{prior}
Page text:
{page_text}"#,
        task = request.task,
        prior = prior,
        page_text = request.page_text
    );

    (user_message, system_message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_messages_embed_task_and_text() {
        let request = ExtractionRequest {
            task: "Extract permits from Mesa".to_string(),
            page_text: "BLD2024-001  12 E Main".to_string(),
            prior_context: None,
        };

        let (user, system) = build_extraction_messages(&request);
        assert!(user.contains("Extract permits from Mesa"));
        assert!(user.contains("BLD2024-001"));
        assert!(!user.contains("previous page"));
        assert!(system.contains("ONLY valid JSON"));
    }

    #[test]
    fn test_build_messages_include_prior_context() {
        let request = ExtractionRequest {
            task: "t".to_string(),
            page_text: "p".to_string(),
            prior_context: Some("page 1 had 4 permits".to_string()),
        };

        let (user, _) = build_extraction_messages(&request);
        assert!(user.contains("previous page"));
        assert!(user.contains("page 1 had 4 permits"));
    }
}

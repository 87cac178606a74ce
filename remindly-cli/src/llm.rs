//! HTTP adapter that lets a hosted model resolve what the rule parser cannot.

use anyhow::{Context, Result, anyhow, bail};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use remindly_core::{Error, FallbackReply, FallbackRequest, FallbackResolver, decode_payload};
use serde::{Deserialize, Serialize};

use crate::auth;
use crate::config::LlmSection;

const SYSTEM_PROMPT: &str = r#"Ты разбираешь русские просьбы о напоминаниях.
Первые строки сообщения: NOW_ISO (текущее время пользователя) и TZ_DEFAULT (его часовой пояс).
Ответь ОДНИМ JSON-объектом без пояснений.

Если понятно, когда напомнить:
{"intent":"create_reminder","title":"что напомнить","description":"детали или пусто",
 "fixed_datetime":"YYYY-MM-DDTHH:MM+HH:MM"}
или для повторяющихся:
{"intent":"create_reminder","title":"...","recurrence":{"type":"daily|weekly|monthly|yearly",
 "weekday":"mon..sun, через запятую","day":15,"month":3,"time":"HH:MM"}}

Если время неоднозначно или не указано:
{"intent":"ask_clarification","question":"короткий вопрос",
 "variants":[{"label":"Завтра в 07:00","iso_datetime":"YYYY-MM-DDTHH:MM+HH:MM"},"Другое"]}

Время всегда в часовом поясе TZ_DEFAULT, только в будущем относительно NOW_ISO."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAI,
}

impl Provider {
    fn parse(name: &str) -> Result<Option<Self>> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Some(Provider::OpenAI)),
            "anthropic" | "claude" => Ok(Some(Provider::Anthropic)),
            "" | "none" | "off" => Ok(None),
            other => bail!("unknown llm provider {other:?} (expected openai, anthropic or none)"),
        }
    }
}

/// Model-backed resolver. Built only when a provider and its key are configured.
#[derive(Debug, Clone)]
pub struct LlmResolver {
    provider: Provider,
    model: String,
    temperature: f32,
    key: String,
    client: reqwest::Client,
}

impl LlmResolver {
    pub fn from_config(cfg: &LlmSection) -> Result<Option<Self>> {
        let Some(provider) = Provider::parse(&cfg.provider)? else {
            return Ok(None);
        };
        let auth = auth::load_auth()?;
        let key = match provider {
            Provider::OpenAI => auth.openai_api_key,
            Provider::Anthropic => auth.anthropic_token,
        };
        let Some(key) = key else {
            tracing::warn!(?provider, "no API key; model fallback disabled");
            return Ok(None);
        };
        Ok(Some(Self {
            provider,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            key,
            client: reqwest::Client::new(),
        }))
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    async fn complete(&self, user: &str) -> Result<String> {
        match self.provider {
            Provider::Anthropic => self.anthropic_complete(user).await,
            Provider::OpenAI => self.openai_complete(user).await,
        }
    }

    async fn anthropic_complete(&self, user: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            max_tokens: i32,
            temperature: f32,
            system: &'a str,
            messages: Vec<Msg<'a>>,
        }

        #[derive(Deserialize)]
        struct Resp {
            content: Vec<ContentBlock>,
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            #[serde(rename = "type")]
            t: String,
            text: Option<String>,
        }

        let body = Req {
            model: &self.model,
            max_tokens: 400,
            temperature: self.temperature,
            system: SYSTEM_PROMPT,
            messages: vec![Msg {
                role: "user",
                content: user,
            }],
        };

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.key)?);
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .headers(headers)
            .json(&body)
            .send()
            .await
            .context("anthropic request")?;

        let status = resp.status();
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            bail!("anthropic error: {status} {txt}");
        }

        let out: Resp = resp.json().await.context("parse anthropic response")?;
        let text: String = out
            .content
            .into_iter()
            .filter(|b| b.t == "text")
            .filter_map(|b| b.text)
            .collect();
        Ok(text.trim().to_string())
    }

    async fn openai_complete(&self, user: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: MsgOut,
        }

        #[derive(Deserialize)]
        struct MsgOut {
            content: Option<String>,
        }

        let body = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
        };

        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header(AUTHORIZATION, format!("Bearer {}", self.key))
            .json(&body)
            .send()
            .await
            .context("openai request")?;

        let status = resp.status();
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            bail!("openai error: {status} {txt}");
        }

        let out: Resp = resp.json().await.context("parse openai response")?;
        out.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| anyhow!("openai returned no content"))
    }
}

/// Header lines, a blank line, then the user's words.
pub fn user_message(request: &FallbackRequest) -> String {
    format!("{}\n\n{}", request.header(), request.text)
}

impl FallbackResolver for LlmResolver {
    async fn resolve(&self, request: &FallbackRequest) -> remindly_core::Result<FallbackReply> {
        let raw = self
            .complete(&user_message(request))
            .await
            .map_err(|e| Error::FallbackFailure(format!("{e:#}")))?;
        tracing::debug!(provider = ?self.provider, reply = %raw, "model replied");
        decode_payload(&raw, &request.timezone)
    }
}

/// Either a configured model or nothing; the assistant stays generic over one type.
#[derive(Debug, Clone)]
pub enum Fallback {
    Model(LlmResolver),
    Disabled,
}

impl FallbackResolver for Fallback {
    async fn resolve(&self, request: &FallbackRequest) -> remindly_core::Result<FallbackReply> {
        match self {
            Fallback::Model(model) => model.resolve(request).await,
            Fallback::Disabled => Err(Error::FallbackFailure("no model configured".into())),
        }
    }

    fn is_available(&self) -> bool {
        matches!(self, Fallback::Model(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use remindly_core::TimezoneSpec;

    #[test]
    fn provider_names() {
        assert_eq!(Provider::parse("OpenAI").unwrap(), Some(Provider::OpenAI));
        assert_eq!(Provider::parse("claude").unwrap(), Some(Provider::Anthropic));
        assert_eq!(Provider::parse("none").unwrap(), None);
        assert!(Provider::parse("gemini").is_err());
    }

    #[test]
    fn user_message_leads_with_context() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 7, 0, 0).unwrap();
        let req = FallbackRequest::new("к врачу как обычно", now, TimezoneSpec::Fixed(180));
        assert_eq!(
            user_message(&req),
            "NOW_ISO=2026-10-16T10:00+03:00\nTZ_DEFAULT=+03:00\n\nк врачу как обычно"
        );
    }

    #[tokio::test]
    async fn disabled_fallback_fails() {
        let req = FallbackRequest::new("x", Utc::now(), TimezoneSpec::utc());
        assert!(matches!(
            Fallback::Disabled.resolve(&req).await,
            Err(Error::FallbackFailure(_))
        ));
    }
}

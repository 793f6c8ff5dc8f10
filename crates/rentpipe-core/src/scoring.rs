use crate::config::ScoringConfig;
use crate::model::{Property, SENTINEL_AVERAGE_SCORE};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const SCORE_GROUPS_PER_CALL: usize = 4;

pub const SCORING_SYSTEM_PROMPT: &str = "你是一位专业的房屋居住质量评估员，需要对房屋进行\"分项打分\"和\"总评分\"，标准如下：
1. 房屋质量 (0~10 分)：
   - 如果房屋缺少翻新、老旧或有明显缺陷，可给 3 分以下。
   - 普通装修或信息不足，可给 4~6 分。
   - 有翻新、材料优质或描述明确，可给 7~9 分。
   - 高端精装修或全新房，给 10 分。
2. 居住体验 (0~10 分)：
   - 噪音、空间狭小、采光差，可给 3 分以下。
   - 一般居住条件或描述不清，可给 4~6 分。
   - 宽敞、通风良好、配有空调等，可给 7~9 分。
   - 特别舒适、配置高级，可给 10 分。
3. 房屋内部配套设施 (0~10 分)：
   - 若只具备基本设施或缺少描述，可给 3~5 分。
   - 普通现代设施（空调、洗衣机、厨房电器等）可给 6~8 分。
   - 特别齐全、高端智能家居，可给 9~10 分。

总评分 (0~20)：
   = (房屋质量 + 居住体验 + 房屋内部配套设施) / 30 * 20

请一次性给出4组【独立的】打分结果，每组包括：
   房屋质量:X, 居住体验:Y, 房屋内配套:Z, 总评分:W
仅输出以上格式，每组一行，不可包含除数字、小数点、逗号、冒号、换行以外的文本。
示例：
房屋质量:7, 居住体验:6, 房屋内配套:8, 总评分:14.0
房屋质量:8, 居住体验:7, 房屋内配套:7, 总评分:14.7
房屋质量:6, 居住体验:8, 房屋内配套:9, 总评分:15.3
房屋质量:9, 居住体验:6, 房屋内配套:7, 总评分:14.7
";

pub const KEYWORDS_EN_SYSTEM_PROMPT: &str = "从房源描述中提取简洁的关键词，包括以下10个维度：
1.安全性：门禁系统、安保设施等
2.重要家电：空调、烘干机等配置
3.厨房：有无灶台，灶台大小/类型，有无洗碗机、微波炉、烤箱等
4.装修状况：是否带家具，装修风格
5.储物空间：衣柜、储藏室，可容纳床尺寸评估等
6.洗手间：是否干湿分离、配备浴缸等
7.社区配套：健身房、游泳池等公共设施
8.购物：周边有无较大的买菜市场、药店等
9.户外空间：采光状态、景观特色，庭院或阳台私密性评估等
10.地理位置：临近商店、公园、餐厅等

用英文输出，描述中未提及的维度不要输出，关键词数量≤11个，不包含额外文字。
示例格式：\"large courtyard, built-in wardrobes, master suite bathroom, air conditioning, ample storage, open kitchen, SMEG appliances, NBN ready, indoor heated pool, gym, private landscaped courtyard\"
";

pub const KEYWORDS_CN_SYSTEM_PROMPT: &str = "从给定的房屋描述中提取关键词，关键词请用中文输出。
要求关键词应包含房屋的位置、特征和可用设施。
只输出关键词，用逗号分隔，不要包含其他文字。";

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("scoring API request failed: {0}")]
    Request(String),
    #[error("scoring API returned status {0}")]
    BadStatus(u16),
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, ScoringError>;
}

/// Real gateway talking to a DashScope-compatible chat-completions endpoint.
pub struct DashscopeGateway {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model_name: String,
    temperature: f32,
}

impl DashscopeGateway {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            endpoint: "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions".to_string(),
            model_name: "qwen-plus".to_string(),
            temperature: config.temperature,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl LlmGateway for DashscopeGateway {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, ScoringError> {
        let body = serde_json::json!({
            "model": self.model_name,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": self.temperature,
            "top_p": 0.9,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ScoringError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ScoringError::BadStatus(response.status().as_u16()));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|err| ScoringError::Request(err.to_string()))?;

        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ScoringError::Request("missing message content in response".to_string()))
    }
}

/// Test double returning scripted responses keyed by system prompt identity.
#[derive(Debug, Default)]
pub struct FakeLlmGateway {
    pub scoring_responses: std::sync::Mutex<Vec<String>>,
    pub keyword_en_response: String,
    pub keyword_cn_response: String,
    pub calls: std::sync::Mutex<u32>,
}

impl FakeLlmGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scoring_responses(mut self, responses: Vec<String>) -> Self {
        self.scoring_responses = std::sync::Mutex::new(responses);
        self
    }
}

#[async_trait]
impl LlmGateway for FakeLlmGateway {
    async fn complete(&self, system_prompt: &str, _user_prompt: &str) -> Result<String, ScoringError> {
        *self.calls.lock().unwrap() += 1;
        if system_prompt == SCORING_SYSTEM_PROMPT {
            let mut responses = self.scoring_responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(String::new());
            }
            Ok(responses.remove(0))
        } else if system_prompt == KEYWORDS_EN_SYSTEM_PROMPT {
            Ok(self.keyword_en_response.clone())
        } else {
            Ok(self.keyword_cn_response.clone())
        }
    }
}

static TOTAL_SCORE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)总评分\s*:\s*(\d+(?:\.\d+)?)").expect("valid score regex"));

/// Parses all `总评分:<n>` matches in a response, keeping only values in
/// `[0, 20]`.
pub fn parse_scores(response: &str) -> Vec<f64> {
    TOTAL_SCORE_PATTERN
        .captures_iter(response)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
        .filter(|score| (0.0..=20.0).contains(score))
        .collect()
}

fn strip_keyword_prefix(text: &str, prefixes: &[&str]) -> String {
    let trimmed = text.trim();
    for prefix in prefixes {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return rest.trim().to_string();
        }
    }
    trimmed.to_string()
}

pub struct ScoringService {
    gateway: Arc<dyn LlmGateway>,
    num_calls: usize,
    max_retries: u32,
}

impl ScoringService {
    pub fn new(gateway: Arc<dyn LlmGateway>, num_calls: usize) -> Self {
        Self { gateway, num_calls, max_retries: 3 }
    }

    async fn call_with_backoff(&self, system_prompt: &str, user_prompt: &str) -> Option<String> {
        for attempt in 0..self.max_retries {
            match self.gateway.complete(system_prompt, user_prompt).await {
                Ok(response) => return Some(response),
                Err(err) => {
                    warn!(attempt, %err, "scoring call failed");
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    }
                }
            }
        }
        None
    }

    /// Runs `num_calls` independent scoring calls, each expected to yield
    /// exactly `SCORE_GROUPS_PER_CALL` totals; a call that doesn't parse to
    /// exactly four contributes four zeros instead of a partial result.
    pub async fn score_description(&self, description: &str) -> (f64, Vec<f64>) {
        if description.trim().is_empty() {
            return (0.0, Vec::new());
        }

        let user_prompt = format!(
            "根据以下房源描述，对房屋质量、居住体验、房屋内部配套设施三个维度分别打 0~10 分，并给出总评分（0~20分）。\n\
请参考系统提示中的具体扣分/加分建议。\n\
房源描述：{description}\n\
请严格按系统提示输出 4 组打分，每组一行，不要输出任何多余的文字。"
        );

        let mut all_scores = Vec::with_capacity(self.num_calls * SCORE_GROUPS_PER_CALL);
        for _ in 0..self.num_calls {
            let response = self.call_with_backoff(SCORING_SYSTEM_PROMPT, &user_prompt).await;
            let parsed = response.map(|r| parse_scores(&r)).unwrap_or_default();
            if parsed.len() == SCORE_GROUPS_PER_CALL {
                all_scores.extend(parsed);
            } else {
                all_scores.extend(std::iter::repeat_n(0.0, SCORE_GROUPS_PER_CALL));
            }
        }

        if all_scores.iter().all(|s| *s == 0.0) {
            return (SENTINEL_AVERAGE_SCORE, vec![0.0; SCORE_GROUPS_PER_CALL * self.num_calls]);
        }

        let mean = all_scores.iter().sum::<f64>() / all_scores.len() as f64;
        (round1(mean), all_scores)
    }

    pub async fn extract_keywords_en(&self, description: &str) -> String {
        if description.trim().is_empty() {
            return String::new();
        }
        let response = self.call_with_backoff(KEYWORDS_EN_SYSTEM_PROMPT, description).await;
        response
            .map(|r| strip_keyword_prefix(&r, &["keywords:", "Keywords:"]))
            .unwrap_or_default()
    }

    pub async fn extract_keywords_cn(&self, description: &str) -> String {
        if description.trim().is_empty() {
            return String::new();
        }
        let response = self.call_with_backoff(KEYWORDS_CN_SYSTEM_PROMPT, description).await;
        response
            .map(|r| strip_keyword_prefix(&r, &["关键词:", "关键词："]))
            .unwrap_or_default()
    }

    /// Scores and extracts keywords for one property in place, skipping
    /// fields that are already populated.
    pub async fn process_property(&self, property: &mut Property) {
        let description = property.description_en.clone().unwrap_or_default();

        if property.average_score.is_none() {
            let (avg, scores) = self.score_description(&description).await;
            property.average_score = Some(avg);
            property.scores = scores;
        }

        if property.keywords.as_deref().unwrap_or("").is_empty() {
            property.keywords = Some(self.extract_keywords_en(&description).await);
        }

        if property.description_cn.as_deref().unwrap_or("").is_empty() {
            property.description_cn = Some(self.extract_keywords_cn(&description).await);
        }
    }

    /// Processes a batch with a bounded worker pool; properties already
    /// satisfying `scoring_already_complete` are skipped when `skip_existing`.
    pub async fn process_properties(
        &self,
        properties: &mut [Property],
        skip_existing: bool,
        max_workers: usize,
    ) {
        let indices: Vec<usize> = properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.has_details())
            .filter(|(_, p)| !(skip_existing && p.scoring_already_complete()))
            .map(|(i, _)| i)
            .collect();

        if indices.is_empty() {
            debug!("no properties require scoring");
            return;
        }

        // Process in bounded chunks to emulate a fixed-size worker pool
        // without handing out aliased mutable references across tasks.
        for chunk in indices.chunks(max_workers.max(1)) {
            let mut handles = Vec::new();
            for &idx in chunk {
                let description = properties[idx].description_en.clone().unwrap_or_default();
                let gateway = self.gateway.clone();
                let num_calls = self.num_calls;
                let max_retries = self.max_retries;
                handles.push((idx, tokio::spawn(async move {
                    let service = ScoringService { gateway, num_calls, max_retries };
                    let (avg, scores) = service.score_description(&description).await;
                    let keywords = service.extract_keywords_en(&description).await;
                    let description_cn = service.extract_keywords_cn(&description).await;
                    (avg, scores, keywords, description_cn)
                })));
            }

            for (idx, handle) in handles {
                if let Ok((avg, scores, keywords, description_cn)) = handle.await {
                    let property = &mut properties[idx];
                    if property.average_score.is_none() {
                        property.average_score = Some(avg);
                        property.scores = scores;
                    }
                    if property.keywords.as_deref().unwrap_or("").is_empty() {
                        property.keywords = Some(keywords);
                    }
                    if property.description_cn.as_deref().unwrap_or("").is_empty() {
                        property.description_cn = Some(description_cn);
                    }
                }
            }
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scores_extracts_valid_totals() {
        let response = "房屋质量:7, 居住体验:6, 房屋内配套:8, 总评分:14.0\n\
房屋质量:8, 居住体验:7, 房屋内配套:7, 总评分:14.7\n";
        let scores = parse_scores(response);
        assert_eq!(scores, vec![14.0, 14.7]);
    }

    #[test]
    fn parse_scores_rejects_out_of_range() {
        let response = "总评分:25.0\n总评分:-1\n总评分:12.5";
        assert_eq!(parse_scores(response), vec![12.5]);
    }

    #[tokio::test]
    async fn score_description_returns_zero_for_empty_description() {
        let gateway = Arc::new(FakeLlmGateway::new());
        let service = ScoringService::new(gateway, 2);
        let (avg, scores) = service.score_description("").await;
        assert_eq!(avg, 0.0);
        assert!(scores.is_empty());
    }

    #[tokio::test]
    async fn score_description_uses_sentinel_on_total_parse_failure() {
        let gateway = Arc::new(FakeLlmGateway::new().with_scoring_responses(vec![
            "garbage".to_string(),
            "garbage".to_string(),
        ]));
        let service = ScoringService::new(gateway, 2);
        let (avg, scores) = service.score_description("a real description").await;
        assert_eq!(avg, SENTINEL_AVERAGE_SCORE);
        assert_eq!(scores, vec![0.0; 8]);
    }

    #[tokio::test]
    async fn score_description_averages_eight_totals() {
        let call_text = "房屋质量:7, 居住体验:6, 房屋内配套:8, 总评分:14.0\n\
房屋质量:8, 居住体验:7, 房屋内配套:7, 总评分:15.0\n\
房屋质量:6, 居住体验:8, 房屋内配套:9, 总评分:16.0\n\
房屋质量:9, 居住体验:6, 房屋内配套:7, 总评分:13.0\n";
        let gateway = Arc::new(FakeLlmGateway::new().with_scoring_responses(vec![
            call_text.to_string(),
            call_text.to_string(),
        ]));
        let service = ScoringService::new(gateway, 2);
        let (avg, scores) = service.score_description("a description").await;
        assert_eq!(scores.len(), 8);
        assert_eq!(avg, 14.5);
    }

    #[tokio::test]
    async fn extract_keywords_en_strips_prefix() {
        let gateway = Arc::new(FakeLlmGateway {
            keyword_en_response: "keywords: quiet street, air conditioning".to_string(),
            ..FakeLlmGateway::new()
        });
        let service = ScoringService::new(gateway, 1);
        let keywords = service.extract_keywords_en("a description").await;
        assert_eq!(keywords, "quiet street, air conditioning");
    }
}

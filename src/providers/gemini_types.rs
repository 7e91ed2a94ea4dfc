//! Wire structs for the Gemini `generateContent` API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiTool>>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(rename = "functionResponse", skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn function_call(call: FunctionCall) -> Self {
        Self {
            function_call: Some(call),
            ..Self::default()
        }
    }

    pub fn function_response(response: FunctionResponse) -> Self {
        Self {
            function_response: Some(response),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateContentResponse {
    pub candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    pub usage_metadata: Option<UsageMetadata>,
    pub error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
pub struct Candidate {
    pub content: Option<Content>,
    #[serde(rename = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    pub prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    pub candidates_token_count: u64,
    #[serde(rename = "totalTokenCount", default)]
    pub total_token_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct GeminiError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_camel_case_config() {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text("Hello")],
            }],
            tools: None,
            generation_config: Some(GenerationConfig {
                temperature: Some(0.7),
                top_p: Some(0.9),
                max_output_tokens: Some(1024),
                stop_sequences: Some(vec!["END".to_string()]),
            }),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "Hello");
        assert_eq!(json["generationConfig"]["temperature"], 0.7);
        assert_eq!(json["generationConfig"]["topP"], 0.9);
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(json["generationConfig"]["stopSequences"][0], "END");
    }

    #[test]
    fn tools_serialize_as_function_declarations() {
        let tool = GeminiTool {
            function_declarations: vec![FunctionDeclaration {
                name: "get_weather".to_string(),
                description: Some("Look up weather".to_string()),
                parameters: Some(serde_json::json!({"type": "object"})),
            }],
        };
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["functionDeclarations"][0]["name"], "get_weather");
    }

    #[test]
    fn response_parses_candidates_and_usage() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {"parts": [{"text": "Hi there"}], "role": "model"},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {
                    "promptTokenCount": 4,
                    "candidatesTokenCount": 3,
                    "totalTokenCount": 7
                }
            }"#,
        )
        .unwrap();

        let candidate = &response.candidates.as_ref().unwrap()[0];
        assert_eq!(candidate.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage_metadata.unwrap().total_token_count, 7);
    }

    #[test]
    fn function_call_parts_round_trip() {
        let part: Part = serde_json::from_str(
            r#"{"functionCall": {"name": "search", "args": {"q": "rust"}}}"#,
        )
        .unwrap();
        let call = part.function_call.unwrap();
        assert_eq!(call.name, "search");
        assert_eq!(call.args["q"], "rust");
    }

    #[test]
    fn error_body_parses() {
        let response: GenerateContentResponse =
            serde_json::from_str(r#"{"error": {"code": 401, "message": "bad token"}}"#).unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, 401);
        assert_eq!(error.message, "bad token");
    }
}

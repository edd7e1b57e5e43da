//! PayloadCodec - args/kwargs blob と Task の相互変換
//!
//! # デシリアライズフロー
//! 1. Task Store から args_blob / kwargs_blob を受け取る
//! 2. serde_json で `Value` に戻す（形が違えば CodecError）
//! 3. positional args なら struct を配列から、keyword args なら object から復元

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("args must be a JSON array, got {0}")]
    ArgsNotArray(&'static str),

    #[error("kwargs must be a JSON object, got {0}")]
    KwargsNotObject(&'static str),

    #[error("positional and keyword arguments cannot be mixed")]
    MixedArguments,

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON codec for task arguments and results.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn new() -> Self {
        Self
    }

    /// `null` is stored as `[]`.
    pub fn encode_args(&self, args: &Value) -> Result<String, CodecError> {
        match args {
            Value::Null => Ok("[]".to_string()),
            Value::Array(_) => Ok(serde_json::to_string(args)?),
            other => Err(CodecError::ArgsNotArray(kind_of(other))),
        }
    }

    /// `null` is stored as `{}`.
    pub fn encode_kwargs(&self, kwargs: &Value) -> Result<String, CodecError> {
        match kwargs {
            Value::Null => Ok("{}".to_string()),
            Value::Object(_) => Ok(serde_json::to_string(kwargs)?),
            other => Err(CodecError::KwargsNotObject(kind_of(other))),
        }
    }

    pub fn decode_args(&self, blob: &str) -> Result<Vec<Value>, CodecError> {
        match serde_json::from_str::<Value>(blob)? {
            Value::Array(items) => Ok(items),
            other => Err(CodecError::ArgsNotArray(kind_of(&other))),
        }
    }

    pub fn decode_kwargs(&self, blob: &str) -> Result<Map<String, Value>, CodecError> {
        match serde_json::from_str::<Value>(blob)? {
            Value::Object(map) => Ok(map),
            other => Err(CodecError::KwargsNotObject(kind_of(&other))),
        }
    }

    /// Builds `T` from either positional or keyword arguments.
    pub fn decode_task<T: DeserializeOwned>(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<T, CodecError> {
        let source = match (args.is_empty(), kwargs.is_empty()) {
            (false, false) => return Err(CodecError::MixedArguments),
            (false, true) => Value::Array(args),
            (true, _) => Value::Object(kwargs),
        };
        Ok(serde_json::from_value(source)?)
    }

    pub fn encode_value<T: Serialize>(&self, value: &T) -> Result<Value, CodecError> {
        Ok(serde_json::to_value(value)?)
    }

    pub fn encode_result(&self, result: &Value) -> Result<String, CodecError> {
        Ok(serde_json::to_string(result)?)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[test]
    fn decodes_from_positional_or_keyword_arguments() {
        let codec = PayloadCodec::new();

        let positional: Add = codec
            .decode_task(codec.decode_args("[1, 2]").unwrap(), Map::new())
            .unwrap();
        let keyword: Add = codec
            .decode_task(Vec::new(), codec.decode_kwargs(r#"{"a": 1, "b": 2}"#).unwrap())
            .unwrap();

        assert_eq!(positional, Add { a: 1, b: 2 });
        assert_eq!(keyword, positional);
    }

    #[test]
    fn rejects_wrong_shapes() {
        let codec = PayloadCodec::new();
        assert!(matches!(
            codec.encode_args(&json!({"a": 1})),
            Err(CodecError::ArgsNotArray("object"))
        ));
        assert!(matches!(
            codec.decode_kwargs("[1]"),
            Err(CodecError::KwargsNotObject("array"))
        ));
        assert!(matches!(codec.decode_args("not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn mixing_arguments_is_an_error() {
        let codec = PayloadCodec::new();
        let mut kwargs = Map::new();
        kwargs.insert("b".into(), json!(2));
        let result: Result<Add, _> = codec.decode_task(vec![json!(1)], kwargs);
        assert!(matches!(result, Err(CodecError::MixedArguments)));
    }

    #[test]
    fn null_arguments_are_stored_empty() {
        let codec = PayloadCodec::new();
        assert_eq!(codec.encode_args(&Value::Null).unwrap(), "[]");
        assert_eq!(codec.encode_kwargs(&Value::Null).unwrap(), "{}");
    }
}

// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Wire frames: one JSON object per line in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::error::CallError;

/// Top-level field of the shutdown frame.
pub const SHUTDOWN_FIELD: &str = "C4NCL0S3";

const QID_FIELD: &str = "qID";

/// Lines that cannot be answered because no correlation id can be recovered.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no qID")]
    MissingQid,
}

/// An accepted request, as handed to a tasker worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub qid: Value,
    pub target: String,
    pub arguments: Vec<Value>,
}

#[derive(Debug, PartialEq)]
pub enum Frame {
    Shutdown,
    Call(Request),
    /// Has a correlation id but cannot be turned into a request.
    Malformed { qid: Value, reason: String },
}

#[derive(Deserialize)]
struct Payload {
    path: String,
    data: Vec<Value>,
}

pub fn parse_frame(line: &str, secret: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(mut object) = value else {
        return Err(FrameError::NotAnObject);
    };

    if object
        .get(SHUTDOWN_FIELD)
        .and_then(Value::as_str)
        .is_some_and(|given| given == secret)
    {
        return Ok(Frame::Shutdown);
    }

    let qid = object.remove(QID_FIELD).ok_or(FrameError::MissingQid)?;
    let Some(payload) = object.remove("payload") else {
        return Ok(Frame::Malformed {
            qid,
            reason: "missing payload".to_string(),
        });
    };
    match serde_json::from_value::<Payload>(payload) {
        Ok(payload) => Ok(Frame::Call(Request {
            qid,
            target: payload.path,
            arguments: payload.data,
        })),
        Err(err) => Ok(Frame::Malformed {
            qid,
            reason: format!("invalid payload: {err}"),
        }),
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Payload(Value),
    Error(ErrorBody),
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Response {
    #[serde(rename = "qID")]
    pub qid: Value,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn success(qid: Value, result: Value) -> Self {
        Self {
            qid,
            outcome: Outcome::Payload(result),
        }
    }

    pub fn failure(qid: Value, err: &CallError) -> Self {
        let traceback = match err {
            CallError::Handler(inner) => format!("{inner:?}"),
            other => format!("{:?}", anyhow::Error::msg(other.to_string())),
        };
        Self {
            qid,
            outcome: Outcome::Error(ErrorBody {
                kind: err.kind().to_string(),
                message: err.message(),
                traceback,
            }),
        }
    }

    /// Compact single-line encoding, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_call() {
        let frame = parse_frame(
            r#"{"qID":1,"payload":{"path":"math:add","data":[2,3]}}"#,
            "s3cr3t",
        )
        .unwrap();
        assert_eq!(
            frame,
            Frame::Call(Request {
                qid: json!(1),
                target: "math:add".into(),
                arguments: vec![json!(2), json!(3)],
            })
        );
    }

    #[test]
    fn shutdown_needs_matching_secret() {
        assert_eq!(
            parse_frame(r#"{"C4NCL0S3":"s3cr3t"}"#, "s3cr3t").unwrap(),
            Frame::Shutdown
        );
        assert!(matches!(
            parse_frame(r#"{"C4NCL0S3":"guess"}"#, "s3cr3t"),
            Err(FrameError::MissingQid)
        ));
    }

    #[test]
    fn bad_payload_keeps_qid() {
        for line in [
            r#"{"qID":"a"}"#,
            r#"{"qID":"a","payload":{"data":[]}}"#,
            r#"{"qID":"a","payload":{"path":"math:add","data":3}}"#,
        ] {
            match parse_frame(line, "s").unwrap() {
                Frame::Malformed { qid, .. } => assert_eq!(qid, json!("a")),
                other => panic!("{line}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn unrecoverable_lines_are_errors() {
        assert!(matches!(parse_frame("{not json", "s"), Err(FrameError::Json(_))));
        assert!(matches!(parse_frame("[1,2]", "s"), Err(FrameError::NotAnObject)));
        assert!(matches!(
            parse_frame(r#"{"payload":{"path":"a:b","data":[]}}"#, "s"),
            Err(FrameError::MissingQid)
        ));
    }

    #[test]
    fn response_encoding() {
        let ok = Response::success(json!(1), json!(5)).to_line().unwrap();
        assert_eq!(ok, r#"{"qID":1,"payload":5}"#);

        let err = Response::failure(json!("x"), &CallError::UnknownRoot("zzz".into()));
        let value: Value = serde_json::from_str(&err.to_line().unwrap()).unwrap();
        assert_eq!(value["qID"], json!("x"));
        assert_eq!(value["error"]["type"], json!("UnknownRoot"));
        assert_eq!(value["error"]["message"], json!("Invalid root endpoint [zzz]"));
        assert!(value["error"]["traceback"].as_str().unwrap().contains("zzz"));
    }
}

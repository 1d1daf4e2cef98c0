// Verify the wire format the gateway process depends on.
// These tests ensure protocol compatibility is never broken.

use ocg_protocol::frames::{EventFrame, InboundFrame, ResFrame};
use ocg_protocol::methods::{ChatParams, DeltaPayload, PulseAddParams};

#[test]
fn req_frame_round_trip() {
    let json = r#"{"type":"req","id":"abc-123","method":"chat.send","params":{"messages":[{"role":"user","content":"hello"}]}}"#;
    let frame: InboundFrame = serde_json::from_str(json).unwrap();
    assert_eq!(frame.frame_type, "req");

    let req = frame.as_req().unwrap();
    assert_eq!(req.method, "chat.send");
    assert_eq!(req.id, "abc-123");

    let params: ChatParams = serde_json::from_value(req.params.unwrap()).unwrap();
    assert_eq!(params.messages.len(), 1);
    assert_eq!(params.messages[0].content, "hello");
    assert!(params.session_key.is_none());
}

#[test]
fn res_ok_serialization() {
    let res = ResFrame::ok("req-1", serde_json::json!({"pong": true}));
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""type":"res""#));
    assert!(json.contains(r#""ok":true"#));
    assert!(json.contains(r#""pong":true"#));
    // error field must be absent on success
    assert!(!json.contains(r#""error""#));
}

#[test]
fn res_err_serialization() {
    let res = ResFrame::err("req-2", "TOOL_BUDGET", "too many tool calls", "");
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""ok":false"#));
    assert!(json.contains(r#""TOOL_BUDGET""#));
    // payload must be absent on error, empty hint omitted
    assert!(!json.contains(r#""payload""#));
    assert!(!json.contains(r#""hint""#));
}

#[test]
fn error_frame_carries_agent_error_code() {
    let err = ocg_core::AgentError::Context("history too large".into());
    let res = ResFrame::from_error("req-3", &err);
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""code":"CONTEXT_OVERFLOW""#));
    assert!(json.contains(r#""hint""#));
}

#[test]
fn stream_event_binds_to_request() {
    let ev = EventFrame::new("chat.delta", DeltaPayload { text: "he".into() })
        .for_request("req-9")
        .with_seq(3);
    let json = serde_json::to_string(&ev).unwrap();

    assert!(json.contains(r#""type":"event""#));
    assert!(json.contains(r#""event":"chat.delta""#));
    assert!(json.contains(r#""id":"req-9""#));
    assert!(json.contains(r#""seq":3"#));
}

#[test]
fn pulse_add_defaults() {
    let json = r#"{"kind":"reminder"}"#;
    let params: PulseAddParams = serde_json::from_str(json).unwrap();
    assert_eq!(params.kind, "reminder");
    assert!(params.scheduled_at.is_none());
    assert!(params.payload.is_null());
}

#[test]
fn non_req_frames_are_rejected_as_requests() {
    let json = r#"{"type":"event","event":"tick"}"#;
    let frame: InboundFrame = serde_json::from_str(json).unwrap();
    assert!(frame.as_req().is_none());
}

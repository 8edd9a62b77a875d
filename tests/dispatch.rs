use insights::mcp::{IdlePolicy, State, handle_message, serve_stream};
use insights::model::{Analysis, DependencyEdge, EdgeType, NewRun, SourceFile};
use insights::repository::Repository;
use insights::transport::{Frame, FrameReader};
use serde_json::{Value, json};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    state: State,
    run_id: i64,
    _temp: TempDir,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let repo = Repository::open(&temp.path().join("insights.sqlite"), None).unwrap();
    let run_id = repo
        .create_run(&NewRun {
            source_path: "/legacy".to_string(),
            ..Default::default()
        })
        .unwrap();
    repo.save_source_files(
        run_id,
        &[
            SourceFile::new("PAY ROLL.cbl", "src/PAY ROLL.cbl", "PROCEDURE DIVISION.\n"),
            SourceFile::new("TAXREC.cpy", "copy/TAXREC.cpy", "01 TAX.\n"),
        ],
    )
    .unwrap();
    repo.save_analyses(
        run_id,
        &[
            Analysis {
                file_name: "PAY ROLL.cbl".to_string(),
                text: "Computes gross pay".to_string(),
                paragraphs: vec!["MAIN-PARA".to_string()],
                ..Default::default()
            },
            Analysis::fallback("TAXREC.cpy", "unauthorized: bad key"),
        ],
    )
    .unwrap();
    repo.save_dependencies(
        run_id,
        &[DependencyEdge::new("PAY ROLL.cbl", "TAXREC.cpy", EdgeType::Copy, Some(12))],
    )
    .unwrap();
    repo.refresh_metrics(run_id).unwrap();
    Fixture {
        state: State::new(repo, Some(run_id), None),
        run_id,
        _temp: temp,
    }
}

fn call(state: &mut State, id: i64, method: &str, params: Value) -> Value {
    handle_message(
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }),
        state,
    )
    .response
    .unwrap_or_else(|| panic!("no response to {method}"))
}

fn read(state: &mut State, uri: &str) -> Value {
    call(state, 1, "resources/read", json!({ "uri": uri }))
}

fn error_code(response: &Value) -> i64 {
    response["error"]["code"]
        .as_i64()
        .unwrap_or_else(|| panic!("expected error, got {response}"))
}

#[test]
fn every_method_answers() {
    let mut fx = fixture();
    assert_eq!(fx.state.run_id(), Some(fx.run_id));
    for method in ["initialize", "ping", "resources/list", "messages/create", "shutdown"] {
        let response = call(&mut fx.state, 1, method, json!({}));
        assert!(response.get("result").is_some(), "{method}: {response}");
        assert_eq!(response["jsonrpc"], "2.0");
    }
    let response = read(&mut fx.state, &format!("insights://runs/{}/summary", fx.run_id));
    assert!(response.get("result").is_some());
}

#[test]
fn successful_reads_are_wrapped() {
    let mut fx = fixture();
    let uri = format!("insights://runs/{}/dependencies", fx.run_id);
    let response = read(&mut fx.state, &uri);
    let content = &response["result"]["contents"][0];
    assert_eq!(content["uri"], uri.as_str());
    assert_eq!(content["mimeType"], "application/json");
    let map: Value = serde_json::from_str(content["text"].as_str().unwrap()).unwrap();
    assert_eq!(map["edge_count"], 1);
    assert_eq!(map["usage"][0]["file_name"], "TAXREC.cpy");
    assert_eq!(map["by_type"]["COPY"], 1);
}

#[test]
fn program_names_are_percent_decoded() {
    let mut fx = fixture();
    let response = read(
        &mut fx.state,
        &format!("insights://runs/{}/analyses/PAY%20ROLL", fx.run_id),
    );
    let text = response["result"]["contents"][0]["text"].as_str().unwrap();
    let analysis: Value = serde_json::from_str(text).unwrap();
    assert_eq!(analysis["file_name"], "PAY ROLL.cbl");
    assert_eq!(analysis["paragraphs"], json!(["MAIN-PARA"]));

    let missing = read(
        &mut fx.state,
        &format!("insights://runs/{}/analyses/NOPE", fx.run_id),
    );
    assert_eq!(error_code(&missing), -32001);
}

#[test]
fn analyses_list_keeps_fallbacks() {
    let mut fx = fixture();
    let response = call(
        &mut fx.state,
        4,
        "resources/read",
        json!({ "uris": [format!("insights://runs/{}/analyses", fx.run_id)] }),
    );
    let text = response["result"]["contents"][0]["text"].as_str().unwrap();
    let list: Value = serde_json::from_str(text).unwrap();
    assert_eq!(list["count"], 2);
    assert_eq!(list["analyses"][1]["failure"], "unauthorized: bad key");
}

#[test]
fn not_found_and_no_data_are_distinct() {
    let mut fx = fixture();
    let missing_file = read(
        &mut fx.state,
        &format!("insights://runs/{}/impact/GHOST.cbl", fx.run_id),
    );
    assert_eq!(error_code(&missing_file), -32001);

    let missing_run = read(&mut fx.state, "insights://runs/999/graph");
    assert_eq!(error_code(&missing_run), -32001);

    let empty_run = fx
        .state
        .repo()
        .create_run(&NewRun::default())
        .unwrap();
    let no_edges = read(
        &mut fx.state,
        &format!("insights://runs/{empty_run}/critical-files"),
    );
    assert_eq!(error_code(&no_edges), -32002);

    let unknown = read(&mut fx.state, "insights://runs/1/heatmap");
    assert_eq!(error_code(&unknown), -32602);

    let no_uri = call(&mut fx.state, 2, "resources/read", json!({}));
    assert_eq!(error_code(&no_uri), -32602);
}

#[test]
fn chat_summary_mentions_run_and_resources() {
    let mut fx = fixture();
    let response = call(
        &mut fx.state,
        9,
        "messages/create",
        json!({ "messages": [{ "role": "user", "content": { "type": "text", "text": "Which copybooks matter?" } }] }),
    );
    assert_eq!(response["result"]["role"], "assistant");
    let text = response["result"]["content"]["text"].as_str().unwrap();
    assert!(text.starts_with("Question: Which copybooks matter?"));
    assert!(text.contains("TAXREC.cpy: 1 references from 1 files"));
    assert!(text.contains(&format!("insights://runs/{}/graph", fx.run_id)));
}

fn frame(value: &Value) -> Vec<u8> {
    let body = serde_json::to_vec(value).unwrap();
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend(body);
    out
}

fn responses(output: Vec<u8>) -> Vec<Value> {
    let mut reader = FrameReader::new(Cursor::new(output));
    let mut out = Vec::new();
    while let Frame::Message(value) = reader.read_frame().unwrap() {
        out.push(value);
    }
    out
}

fn idle() -> IdlePolicy {
    IdlePolicy {
        sleep: Duration::from_millis(1),
        max_idle_polls: 2,
    }
}

#[test]
fn malformed_frames_are_skipped() {
    let mut fx = fixture();
    let mut input = Vec::new();
    input.extend(b"X-Trace: 1\r\n\r\n");
    input.extend(b"Content-Length: 7\r\n\r\n{oops!}");
    input.extend(frame(&json!({ "jsonrpc": "2.0", "id": 5, "method": "ping" })));

    let mut output = Vec::new();
    serve_stream(
        &mut fx.state,
        Cursor::new(input),
        &mut output,
        Arc::new(AtomicBool::new(false)),
        idle(),
    )
    .unwrap();
    let out = responses(output);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0]["id"], 5);
}

fn serve_bytes(state: &mut State, input: Vec<u8>) -> Vec<Value> {
    let mut output = Vec::new();
    serve_stream(
        state,
        Cursor::new(input),
        &mut output,
        Arc::new(AtomicBool::new(false)),
        idle(),
    )
    .unwrap();
    responses(output)
}

#[test]
fn non_utf8_headers_keep_the_session_alive() {
    let mut fx = fixture();
    let mut input = Vec::new();
    // an unknown header line that is not text, inside an otherwise valid frame
    input.extend(b"X-Bad: \xff\xfe\r\n");
    input.extend(frame(&json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" })));
    // a header block with nothing but garbage
    input.extend(b"\xc3\x28: 1\r\n\r\n");
    input.extend(frame(&json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" })));

    let out = serve_bytes(&mut fx.state, input);
    let ids: Vec<i64> = out.iter().filter_map(|r| r["id"].as_i64()).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn oversized_content_length_keeps_the_session_alive() {
    let mut fx = fixture();
    let mut input = Vec::new();
    input.extend(b"Content-Length: 18446744073709551615\r\n\r\n");
    input.extend(frame(&json!({ "jsonrpc": "2.0", "id": 3, "method": "ping" })));
    input.extend(b"Content-Length: 99999999999999999999999\r\n\r\n");
    input.extend(frame(&json!({ "jsonrpc": "2.0", "id": 4, "method": "ping" })));

    let out = serve_bytes(&mut fx.state, input);
    let ids: Vec<i64> = out.iter().filter_map(|r| r["id"].as_i64()).collect();
    assert_eq!(ids, vec![3, 4]);
}

#[test]
fn errors_do_not_stop_the_loop() {
    let mut fx = fixture();
    let mut input = Vec::new();
    input.extend(frame(&json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call" })));
    input.extend(frame(&json!({ "jsonrpc": "2.0", "method": "tools/call" })));
    input.extend(frame(&json!({ "jsonrpc": "2.0", "id": 2 })));
    input.extend(frame(&json!({ "jsonrpc": "2.0", "id": 3, "method": "ping" })));

    let mut output = Vec::new();
    serve_stream(
        &mut fx.state,
        Cursor::new(input),
        &mut output,
        Arc::new(AtomicBool::new(false)),
        idle(),
    )
    .unwrap();
    let out = responses(output);
    assert_eq!(out.len(), 3);
    assert_eq!(error_code(&out[0]), -32601);
    assert_eq!(error_code(&out[1]), -32600);
    assert_eq!(out[2]["result"], json!({}));
}

#[test]
fn cancellation_stops_without_output() {
    let mut fx = fixture();
    let input = frame(&json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }));
    let mut output = Vec::new();
    serve_stream(
        &mut fx.state,
        Cursor::new(input),
        &mut output,
        Arc::new(AtomicBool::new(true)),
        idle(),
    )
    .unwrap();
    assert!(output.is_empty());
}

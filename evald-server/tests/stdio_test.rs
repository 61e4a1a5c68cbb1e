use assert_cmd::Command;
use evald_core::codec::{Protocol, Request, decode_response, encode_request};
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use bytes::BytesMut;

fn evald_cmd() -> Command {
    Command::cargo_bin("evald").unwrap()
}

fn frames(protocol: Protocol, requests: &[Request]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for request in requests {
        encode_request(request, protocol, &mut buf);
    }
    buf.to_vec()
}

fn responses(protocol: Protocol, mut bytes: &[u8]) -> Vec<(bool, String)> {
    let mut out = Vec::new();
    while let Some((response, used)) = decode_response(bytes, protocol, 1 << 20).unwrap() {
        out.push((response.success, response.text));
        bytes = &bytes[used..];
    }
    assert!(bytes.is_empty(), "trailing bytes on stdout");
    out
}

#[test]
fn test_stdio_keyed_session() {
    let input = frames(
        Protocol::Keyed,
        &[
            Request::new(0, "k", "let xs = [1, 2];"),
            Request::new(0, "k", "if len(xs) == 2 {"),
            Request::new(0, "k", "print(\"two\") }"),
            Request::new(0, "other", "xs"),
            Request::new(0, "k", "   "),
            Request::new(0, "k", "push(xs, 'c')"),
        ],
    );

    let output = evald_cmd()
        .arg("--stdio")
        .write_stdin(input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let texts: Vec<String> = responses(Protocol::Keyed, &output)
        .into_iter()
        .map(|(_, text)| text)
        .collect();
    assert_eq!(
        texts,
        vec![
            "".to_string(),
            "(continue...)".to_string(),
            "two\n".to_string(),
            "error: undefined variable `xs`".to_string(),
            "".to_string(),
            "{ 1, 2, 'c' }".to_string(),
        ]
    );
}

#[test]
fn test_stdio_legacy_flags() {
    let input = frames(
        Protocol::Legacy,
        &[
            Request::new(0, "", "1 + 2"),
            Request::new(0, "", "[1,"),
            Request::new(50, "", "2, sleep(60000)]"),
        ],
    );

    let output = evald_cmd()
        .args(["--stdio", "--protocol", "legacy"])
        .write_stdin(input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    assert_eq!(
        responses(Protocol::Legacy, &output),
        vec![
            (true, "3".to_string()),
            (false, "(continue...)".to_string()),
            (false, "(timed out)".to_string()),
        ]
    );
}

#[test]
fn test_stdio_malformed_frame_exits_with_error() {
    evald_cmd()
        .arg("--stdio")
        .write_stdin(vec![0_u8, 0, 0])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("stdio connection failed"));
}

#[test]
fn test_rejects_missing_config_file() {
    evald_cmd()
        .args(["--stdio", "--config", "/nonexistent/evald.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

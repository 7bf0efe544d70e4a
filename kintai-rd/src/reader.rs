//! PC/SC card reader polling via the `opensc-tool` CLI
//!
//! One call to [`poll_card_uid`] blocks until a card is presented, reads
//! its uid with the GET DATA APDU, then waits for the card to leave the
//! field so a single presentation yields a single tap.

use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

const GET_UID_APDU: &str = "FF:CA:00:00:00";

/// Substrings that identify an NFC-capable reader when several are attached
const READER_NAME_HINTS: &[&str] = &[
    "rc-s300",
    "rcs300",
    "pasori",
    "felica",
    "sony",
    "acr122",
    "acs",
    "nfc",
    "contactless",
];

/// Block until a card is presented and removed, returning its uid.
///
/// Runs on a blocking thread; the caller is expected to wrap this in
/// `spawn_blocking`. Failures are transient (reader unplugged, tool
/// missing, unparseable output) and safe to retry.
pub fn poll_card_uid(reader_hint: usize) -> Result<String> {
    let reader = pick_reader_index(reader_hint);
    let output = run_wait_apdu(reader)?;
    let uid = parse_uid(&output);
    if uid.is_empty() {
        return Err(anyhow!("uid parse failed: {}", output.trim()));
    }
    wait_removed(reader);
    Ok(uid)
}

fn list_readers() -> Vec<(usize, String)> {
    let output = match Command::new("opensc-tool").arg("--list-readers").output() {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let mut readers: Vec<(usize, String)> = text.lines().filter_map(parse_reader_line).collect();
    readers.sort_by_key(|(idx, _)| *idx);
    readers
}

fn parse_reader_line(line: &str) -> Option<(usize, String)> {
    let (idx, name) = line.trim().split_once(':')?;
    let idx = idx.trim().parse::<usize>().ok()?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((idx, name.to_string()))
}

fn pick_reader_index(hint: usize) -> usize {
    let readers = list_readers();
    if readers.is_empty() {
        return hint;
    }
    if readers.len() == 1 {
        return readers[0].0;
    }

    for (idx, name) in &readers {
        let lower = name.to_lowercase();
        if READER_NAME_HINTS.iter().any(|key| lower.contains(key)) {
            return *idx;
        }
    }

    if readers.iter().any(|(idx, _)| *idx == hint) {
        return hint;
    }
    readers[0].0
}

/// `opensc-tool --wait` blocks until a card enters the field
fn run_wait_apdu(reader: usize) -> Result<String> {
    let output = Command::new("opensc-tool")
        .args([
            "--reader",
            &reader.to_string(),
            "--wait",
            "--card-driver",
            "default",
            "--send-apdu",
            GET_UID_APDU,
        ])
        .output()
        .context("failed to run opensc-tool")?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(anyhow!("opensc-tool failed: {}", text.trim()));
    }
    Ok(text)
}

/// One non-waiting APDU probe; success means the card is still present
fn card_present(reader: usize) -> bool {
    Command::new("opensc-tool")
        .args([
            "--reader",
            &reader.to_string(),
            "--card-driver",
            "default",
            "--send-apdu",
            GET_UID_APDU,
        ])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn wait_removed(reader: usize) {
    while card_present(reader) {
        thread::sleep(Duration::from_millis(200));
    }
}

fn is_hex_pair(token: &str) -> bool {
    token.len() == 2 && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// Leading run of hex byte tokens on one line, concatenated uppercase
fn leading_hex(line: &str) -> String {
    let mut uid = String::new();
    for token in line.split_whitespace() {
        if !is_hex_pair(token) {
            break;
        }
        uid.push_str(&token.to_uppercase());
    }
    uid
}

/// Extract the uid bytes from opensc-tool output.
///
/// Prefers the hex dump lines following "Received", falling back to the
/// first line that starts with hex byte tokens.
fn parse_uid(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if !line.contains("Received") {
            continue;
        }
        for candidate in lines.iter().skip(i + 1).take(7) {
            let uid = leading_hex(candidate);
            if !uid.is_empty() {
                return uid;
            }
        }
    }

    for line in &lines {
        let uid = leading_hex(line);
        if !uid.is_empty() {
            return uid;
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uid_from_received_block() {
        let output = "Using reader with a card: SONY FeliCa RC-S300/P\n\
                      Sending: FF CA 00 00 00\n\
                      Received (SW1=0x90, SW2=0x00):\n\
                      01 27 00 4E 9A 3B 80 11 .'.N.;..\n";
        assert_eq!(parse_uid(output), "0127004E9A3B8011");
    }

    #[test]
    fn test_parse_uid_fallback_scans_all_lines() {
        let output = "noise\n04 A1 B2 C3\n";
        assert_eq!(parse_uid(output), "04A1B2C3");
    }

    #[test]
    fn test_parse_uid_empty_on_garbage() {
        assert_eq!(parse_uid("no hex here\nstill nothing\n"), "");
    }

    #[test]
    fn test_leading_hex_stops_at_non_hex_token() {
        assert_eq!(leading_hex("04 A1 zz B2"), "04A1");
    }

    #[test]
    fn test_parse_reader_line() {
        assert_eq!(
            parse_reader_line("0: SONY FeliCa RC-S300/P"),
            Some((0, "SONY FeliCa RC-S300/P".to_string()))
        );
        assert_eq!(parse_reader_line("not a reader"), None);
        assert_eq!(parse_reader_line("x: name"), None);
    }
}

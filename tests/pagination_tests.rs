//! Paged `show` capture behavior: pager acknowledgement, artifact removal,
//! and pager-first ordering against the final prompt.

use std::time::Duration;
use switchboard::runner::CommandRunner;
use test_helpers::*;

const SHOW_TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn captures_across_pagination_prompts() {
    // Three pages; the device pauses twice before the final prompt.
    let (session, writes) = scripted_session(&[
        "Building configuration...\n\ninterface GigabitEthernet1\n ip address 192.168.1.1 255.255.255.0\n --More-- ",
        " shutdown\n!\ninterface GigabitEthernet2\n --More--",
        " ip address 10.0.0.1 255.255.255.0\n!\nend\nSwitch# ",
    ]);
    let runner = CommandRunner::new(&session);

    let result = runner.run_show("show run", SHOW_TIMEOUT, None).unwrap();

    // All pages captured, pager artifacts gone, prompt retained.
    assert!(result.contains("GigabitEthernet1"));
    assert!(result.contains("GigabitEthernet2"));
    assert!(result.contains("Switch#"));
    assert!(!result.contains("--More--"));

    // Exactly one SPACE per pager prompt.
    assert_eq!(count_writes(&writes, " "), 2);
    // The command itself went out once.
    assert_eq!(
        written_strings(&writes)
            .iter()
            .filter(|w| w.contains("show run"))
            .count(),
        1
    );
}

#[test]
fn pager_is_checked_before_final_prompt() {
    // A pager prompt that ends in '#' must not terminate the capture.
    let (session, writes) = scripted_session(&[
        "line one\n --More-- #",
        "line two\nSwitch# ",
    ]);
    let runner = CommandRunner::new(&session);

    let result = runner.run_show("show run", SHOW_TIMEOUT, None).unwrap();
    assert!(result.contains("line one"));
    assert!(result.contains("line two"));
    assert!(!result.contains("--More--"));
    assert_eq!(count_writes(&writes, " "), 1);
}

#[test]
fn output_mentioning_more_is_not_swallowed() {
    // "more" as ordinary content, not at the buffer tail as a pager.
    let (session, writes) = scripted_session(&[
        "ip access-list extended more-filters\n permit ip any any\nSwitch# ",
    ]);
    let runner = CommandRunner::new(&session);

    let result = runner.run_show("show run", SHOW_TIMEOUT, None).unwrap();
    assert!(result.contains("more-filters"));
    assert_eq!(count_writes(&writes, " "), 0);
}

#[test]
fn times_out_without_final_prompt() {
    let (session, _writes) = scripted_session(&["partial output, no prompt"]);
    let runner = CommandRunner::new(&session);

    let err = runner
        .run_show("show run", Duration::from_millis(600), None)
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("timeout"), "unexpected error: {msg}");
    assert!(msg.contains("partial output"), "tail missing: {msg}");
}

#[test]
fn streams_raw_chunks_to_on_data() {
    let (session, _writes) = scripted_session(&[
        "page one\r\n --More-- ",
        "page two\r\nSwitch# ",
    ]);
    let runner = CommandRunner::new(&session);

    let mut seen = Vec::new();
    let mut on_data = |chunk: &str| seen.push(chunk.to_string());
    let result = runner
        .run_show("show run", SHOW_TIMEOUT, Some(&mut on_data))
        .unwrap();

    // on_data receives the raw stream, pager artifacts and CRLF included;
    // the returned capture is normalized and pager-free.
    assert_eq!(seen.len(), 2);
    assert!(seen[0].contains("--More--"));
    assert!(seen[0].contains("\r\n"));
    assert!(!result.contains("--More--"));
    assert!(!result.contains('\r'));
}

#[test]
fn disable_paging_failure_does_not_break_capture() {
    // No reply to "terminal length 0": disable_paging gives up quietly, and
    // the dynamic pager handling still produces a clean capture. The pages
    // only become readable once the show command goes out.
    let (session, writes) = reactive_session(&[(
        "show run",
        &["first page\n --More-- ", "second page\nSwitch# "],
    )]);
    let runner = CommandRunner::new(&session);

    runner.disable_paging();
    let result = runner.run_show("show run", SHOW_TIMEOUT, None).unwrap();
    assert!(result.contains("first page"));
    assert!(result.contains("second page"));
    assert!(!result.contains("--More--"));
    assert_eq!(count_writes(&writes, " "), 1);
}

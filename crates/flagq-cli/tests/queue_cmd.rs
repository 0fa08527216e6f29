#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

use std::fs;

use flagq_cli::queue_cmd::{self, StatusReport};

#[test]
fn enqueue_writes_canonical_flag() {
    let dir = tempfile::TempDir::new().unwrap();
    let queue = dir.path().join("analyzer_queue");

    let path = queue_cmd::enqueue(&queue, "abc123", "ExampleExp", "to_present", None).unwrap();

    assert_eq!(path, queue.join("exp_abc123.ready"));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "abc123,ExampleExp,to_present\n"
    );
    // Only the flag itself, no temporary leftovers.
    assert_eq!(fs::read_dir(&queue).unwrap().count(), 1);
}

#[test]
fn enqueue_rejects_bad_fields_and_duplicates() {
    let dir = tempfile::TempDir::new().unwrap();
    let queue = dir.path();

    assert!(queue_cmd::enqueue(queue, "a,b", "Exp", "to_present", None).is_err());
    assert!(queue_cmd::enqueue(queue, "1", "", "to_present", None).is_err());

    queue_cmd::enqueue(queue, "1", "Exp", "to_present", Some("job1")).unwrap();
    assert!(queue_cmd::enqueue(queue, "1", "Exp", "to_present", Some("job1")).is_err());
}

#[test]
fn status_counts_by_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let queue = dir.path();
    fs::write(queue.join("a.ready"), "1,a,k\n").unwrap();
    fs::write(queue.join("b.working"), "2,b,k\n").unwrap();
    fs::write(queue.join("c.done"), "3,c,k\n").unwrap();
    fs::write(queue.join("d.done"), "4,d,k\n").unwrap();
    fs::write(queue.join("e.fail"), "5,e,k\n").unwrap();
    fs::write(queue.join("notes.txt"), "ignored").unwrap();

    let report = StatusReport::collect(queue).unwrap();
    assert_eq!(
        (report.ready, report.working, report.done, report.failed),
        (1, 1, 2, 1)
    );
    assert_eq!(report.in_flight, vec!["b"]);

    let text = report.render();
    assert!(text.contains("working  1"), "unexpected report: {text}");
    assert!(text.contains("flagq requeue --force"));
    assert!(text.contains("(5 flags)"), "unexpected header: {text}");

    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["done"], 2);
    assert_eq!(json["in_flight"][0], "b");
}

#[test]
fn status_of_missing_directory_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    assert!(StatusReport::collect(&dir.path().join("nope")).is_err());
}

#[test]
fn requeue_moves_working_back_to_ready() {
    let dir = tempfile::TempDir::new().unwrap();
    let queue = dir.path();
    fs::write(queue.join("job1.working"), "1,a,k\n").unwrap();

    let path = queue_cmd::requeue(queue, "job1", true).unwrap();
    assert_eq!(path, queue.join("job1.ready"));
    assert!(!queue.join("job1.working").exists());
    assert_eq!(fs::read_to_string(path).unwrap(), "1,a,k\n");
}

#[test]
fn requeue_refuses_other_states() {
    let dir = tempfile::TempDir::new().unwrap();
    let queue = dir.path();
    fs::write(queue.join("job1.done"), "1,a,k\n").unwrap();

    assert!(queue_cmd::requeue(queue, "job1", true).is_err());
    assert!(queue.join("job1.done").exists());
}

#[test]
fn requeue_without_force_leaves_working_flag() {
    let dir = tempfile::TempDir::new().unwrap();
    let queue = dir.path();
    fs::write(queue.join("job1.working"), "1,a,k\n").unwrap();

    let err = queue_cmd::requeue(queue, "job1", false).unwrap_err();
    assert!(err.to_string().contains("--force"), "unexpected error: {err}");
    assert!(queue.join("job1.working").exists());
    assert!(!queue.join("job1.ready").exists());
}

//! Markdown example harness.
//!
//! Every fenced code block in README.md and demos/*.md whose info string
//! carries `test-entrypoint="CMD"` is executed: the fence body becomes
//! the transcript, and any `test-file=NAME` fences seen earlier in the
//! same document are staged into the session's working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

#[derive(Debug)]
struct Codeblock {
    info: HashMap<String, String>,
    contents: String,
}

#[derive(Debug)]
struct Example {
    files: Vec<(String, String)>,
    entrypoint: String,
    transcript: String,
}

fn parse_markdown(path: &Path) -> Vec<Codeblock> {
    parse_markdown_text(&std::fs::read_to_string(path).unwrap())
}

fn parse_markdown_text(text: &str) -> Vec<Codeblock> {
    let fence_re = Regex::new(r"^(?P<prefix> *)(?P<backticks>```+)(?P<info>.*)$").unwrap();

    let mut codeblocks = Vec::new();
    // Open fence: (backtick run, indentation width, block under way).
    let mut current: Option<(String, usize, Codeblock)> = None;

    for line in text.lines() {
        match fence_re.captures(line) {
            Some(captures) => {
                let backticks = captures["backticks"].to_string();
                match current.take() {
                    Some((open_backticks, _, block)) if open_backticks == backticks => {
                        codeblocks.push(block);
                    }
                    Some(still_open) => current = Some(still_open),
                    None => {
                        let info = shell_words::split(captures["info"].trim())
                            .unwrap_or_default()
                            .into_iter()
                            .map(|token| match token.split_once('=') {
                                Some((k, v)) => (k.to_string(), v.to_string()),
                                None => (token, String::new()),
                            })
                            .collect();
                        current = Some((
                            backticks,
                            captures["prefix"].len(),
                            Codeblock {
                                info,
                                contents: String::new(),
                            },
                        ));
                    }
                }
            }
            None => {
                if let Some((_, prefix_len, block)) = current.as_mut() {
                    // Strip the fence's indentation from the body so an
                    // indented fence (e.g. in a list item) yields the
                    // same content as a flush-left one.
                    block.contents.push_str(line.get(*prefix_len..).unwrap_or(""));
                    block.contents.push('\n');
                }
            }
        }
    }

    codeblocks
}

fn codeblocks_to_examples(codeblocks: Vec<Codeblock>) -> Vec<Example> {
    let mut examples = Vec::new();
    let mut files = Vec::new();

    for block in codeblocks {
        if let Some(name) = block.info.get("test-file") {
            files.push((name.clone(), block.contents.clone()));
        }
        if let Some(entrypoint) = block.info.get("test-entrypoint") {
            examples.push(Example {
                files: files.clone(),
                entrypoint: entrypoint.clone(),
                transcript: block.contents.clone(),
            });
        }
    }

    examples
}

fn run_examples_from(path: &Path) {
    let examples = codeblocks_to_examples(parse_markdown(path));
    assert!(
        !examples.is_empty(),
        "{} declares no runnable examples",
        path.display()
    );

    for example in examples {
        let tmp = tempfile::tempdir().unwrap();

        let transcript_path = tmp.path().join("transcript.txt");
        std::fs::write(&transcript_path, &example.transcript).unwrap();

        let session_dir = tmp.path().join("session.tmp");
        std::fs::create_dir(&session_dir).unwrap();
        for (name, contents) in &example.files {
            let file_path = session_dir.join(name);
            if let Some(parent) = file_path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&file_path, contents).unwrap();
        }

        let output = Command::new(env!("CARGO_BIN_EXE_repltest"))
            .arg("--entrypoint")
            .arg(&example.entrypoint)
            .arg("--timeout")
            .arg("30s")
            .arg(&transcript_path)
            .current_dir(&session_dir)
            .env("PS1", "$ ")
            .env("PYTHON_BASIC_REPL", "1")
            .output()
            .unwrap();

        assert!(
            output.status.success(),
            "example in {} failed:\nstdout: {}\nstderr: {}",
            path.display(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
}

#[test]
fn indented_fences_are_dedented() {
    let md = concat!(
        "- a staged file, from a list item:\n",
        "\n",
        "  ```text test-file=nested.txt\n",
        "  first\n",
        "\n",
        "  second\n",
        "  ```\n",
    );
    let blocks = parse_markdown_text(md);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].contents, "first\n\nsecond\n");
    assert_eq!(blocks[0].info["test-file"], "nested.txt");
}

#[test]
fn readme_examples_reproduce() {
    run_examples_from(&PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("README.md"));
}

#[test]
fn demo_examples_reproduce() {
    let demos_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos");
    let mut ran_any = false;
    for entry in std::fs::read_dir(&demos_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|ext| ext == "md") {
            run_examples_from(&path);
            ran_any = true;
        }
    }
    assert!(ran_any, "no demo documents found");
}

//! Boundary to the external text/barcode recognition engine.
//!
//! The engine is opaque: it receives an image path and hands back raw text
//! blocks plus any barcode strings it decoded on its own. Everything after
//! that (token extraction, checksums, attribute rules) lives in
//! [`crate::fusion`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const IMAGE_PLACEHOLDER: &str = "{image}";

/// Exit status a recognizer program uses for an image format it cannot handle.
pub const EXIT_UNSUPPORTED_FORMAT: i32 = 3;
/// Exit status a recognizer program uses for an image it cannot decode.
pub const EXIT_UNREADABLE_IMAGE: i32 = 4;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecognition {
    #[serde(default)]
    pub text_blocks: Vec<String>,
    #[serde(default)]
    pub barcode_decodes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("unreadable image: {0}")]
    Unreadable(String),

    #[error("recognition engine failed: {0}")]
    Engine(String),

    #[error("failed to launch recognizer {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("recognition timed out after {0:?}")]
    TimedOut(Duration),
}

pub trait Recognizer: Send + Sync {
    fn recognize(&self, image: &Path) -> Result<RawRecognition, RecognitionError>;
}

/// Runs `recognizer` on a worker thread and gives up after `timeout`.
///
/// A timed-out worker is left to finish on its own and its result is
/// discarded. Adapters that own a child process must bound it themselves, as
/// [`CommandRecognizer::with_timeout`] does.
pub fn recognize_with_timeout(
    recognizer: &Arc<dyn Recognizer>,
    image: &Path,
    timeout: Duration,
) -> Result<RawRecognition, RecognitionError> {
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(recognizer);
    let image = image.to_path_buf();

    std::thread::Builder::new()
        .name("recognizer".to_string())
        .spawn(move || {
            let _ = tx.send(worker.recognize(&image));
        })
        .map_err(|source| RecognitionError::Launch {
            program: "recognizer worker thread".to_string(),
            source,
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(RecognitionError::TimedOut(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(RecognitionError::Engine(
            "recognizer worker exited without a result".to_string(),
        )),
    }
}

/// Production adapter: runs an external program once per image.
///
/// The image path replaces every `{image}` argument, or is appended when no
/// argument contains the placeholder. Stdout is read as JSON
/// `{"text_blocks": [...], "barcode_decodes": [...]}`; anything else is taken
/// as plain OCR text with one block per non-empty line, which lets plain
/// text-only engines be plugged in directly.
///
/// With a timeout set, a program still running at the deadline is killed and
/// reaped before `TimedOut` is returned.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandRecognizer {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn command_args(&self, image: &Path) -> Vec<OsString> {
        let mut substituted = false;
        let mut out: Vec<OsString> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(IMAGE_PLACEHOLDER) {
                    substituted = true;
                    OsString::from(arg.replace(IMAGE_PLACEHOLDER, &image.to_string_lossy()))
                } else {
                    OsString::from(arg)
                }
            })
            .collect();
        if !substituted {
            out.push(image.as_os_str().to_os_string());
        }
        out
    }
}

impl Recognizer for CommandRecognizer {
    fn recognize(&self, image: &Path) -> Result<RawRecognition, RecognitionError> {
        let mut child = Command::new(&self.program)
            .args(self.command_args(image))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RecognitionError::Launch {
                program: self.program.display().to_string(),
                source,
            })?;

        // Both pipes are drained while waiting so a chatty engine cannot
        // block on a full pipe buffer.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.timeout {
            Some(timeout) => wait_with_deadline(&mut child, timeout)?,
            None => child.wait().map_err(|err| {
                RecognitionError::Engine(format!("failed to wait for recognizer: {err}"))
            })?,
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(match status.code() {
                Some(EXIT_UNSUPPORTED_FORMAT) => RecognitionError::UnsupportedFormat(stderr),
                Some(EXIT_UNREADABLE_IMAGE) => RecognitionError::Unreadable(stderr),
                code => RecognitionError::Engine(format!("exit status {code:?}: {stderr}")),
            });
        }

        Ok(parse_engine_output(&String::from_utf8_lossy(&stdout)))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn collect(reader: JoinHandle<Vec<u8>>) -> Vec<u8> {
    reader.join().unwrap_or_default()
}

/// Polls `child` until it exits or `timeout` passes. On timeout the child is
/// killed and reaped, so nothing outlives the call.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<ExitStatus, RecognitionError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(pid = child.id(), ?timeout, "killed recognizer past its deadline");
                return Err(RecognitionError::TimedOut(timeout));
            }
            Ok(None) => std::thread::sleep(CHILD_POLL_INTERVAL),
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RecognitionError::Engine(format!(
                    "failed to wait for recognizer: {err}"
                )));
            }
        }
    }
}

pub fn parse_engine_output(stdout: &str) -> RawRecognition {
    if let Ok(parsed) = serde_json::from_str::<RawRecognition>(stdout.trim()) {
        return parsed;
    }
    RawRecognition {
        text_blocks: stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        barcode_decodes: Vec::new(),
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Output(RawRecognition),
    Unreadable(String),
    Unsupported(String),
    Slow(Duration, RawRecognition),
}

/// Deterministic recognizer for tests, scripted by file name.
///
/// Files without a script produce an empty recognition.
#[derive(Debug, Default)]
pub struct FakeRecognizer {
    scripts: HashMap<String, Scripted>,
    calls: AtomicUsize,
    seen: Mutex<Vec<PathBuf>>,
}

impl FakeRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, file_name: &str, text_blocks: &[&str], decodes: &[&str]) -> Self {
        self.scripts.insert(
            file_name.to_string(),
            Scripted::Output(raw(text_blocks, decodes)),
        );
        self
    }

    pub fn with_unreadable(mut self, file_name: &str, reason: &str) -> Self {
        self.scripts
            .insert(file_name.to_string(), Scripted::Unreadable(reason.to_string()));
        self
    }

    pub fn with_unsupported(mut self, file_name: &str, reason: &str) -> Self {
        self.scripts
            .insert(file_name.to_string(), Scripted::Unsupported(reason.to_string()));
        self
    }

    pub fn with_delay(mut self, file_name: &str, delay: Duration, text_blocks: &[&str]) -> Self {
        self.scripts.insert(
            file_name.to_string(),
            Scripted::Slow(delay, raw(text_blocks, &[])),
        );
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, file_name: &str) -> usize {
        self.seen
            .lock()
            .map(|seen| {
                seen.iter()
                    .filter(|p| p.file_name().is_some_and(|n| n == file_name))
                    .count()
            })
            .unwrap_or(0)
    }
}

fn raw(text_blocks: &[&str], decodes: &[&str]) -> RawRecognition {
    RawRecognition {
        text_blocks: text_blocks.iter().map(|s| s.to_string()).collect(),
        barcode_decodes: decodes.iter().map(|s| s.to_string()).collect(),
    }
}

impl Recognizer for FakeRecognizer {
    fn recognize(&self, image: &Path) -> Result<RawRecognition, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(image.to_path_buf());
        }

        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match self.scripts.get(&name) {
            None => Ok(RawRecognition::default()),
            Some(Scripted::Output(out)) => Ok(out.clone()),
            Some(Scripted::Unreadable(reason)) => Err(RecognitionError::Unreadable(reason.clone())),
            Some(Scripted::Unsupported(reason)) => {
                Err(RecognitionError::UnsupportedFormat(reason.clone()))
            }
            Some(Scripted::Slow(delay, out)) => {
                std::thread::sleep(*delay);
                Ok(out.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_engine_output_accepts_json_and_plain_text() {
        let json = r#"{"text_blocks": ["EPSON 03C"], "barcode_decodes": ["8885007027531"]}"#;
        let parsed = parse_engine_output(json);
        assert_eq!(parsed.text_blocks, vec!["EPSON 03C".to_string()]);
        assert_eq!(parsed.barcode_decodes, vec!["8885007027531".to_string()]);

        let partial = parse_engine_output(r#"{"text_blocks": ["only text"]}"#);
        assert!(partial.barcode_decodes.is_empty());

        let plain = parse_engine_output("EPSON\n\n  03C Black  \n");
        assert_eq!(
            plain.text_blocks,
            vec!["EPSON".to_string(), "03C Black".to_string()]
        );
        assert!(plain.barcode_decodes.is_empty());
    }

    #[test]
    fn command_args_substitute_or_append_image() {
        let image = Path::new("/tmp/x.jpg");
        let appended = CommandRecognizer::new(PathBuf::from("ocr"), vec!["--json".to_string()]);
        assert_eq!(
            appended.command_args(image),
            vec![OsString::from("--json"), OsString::from("/tmp/x.jpg")]
        );

        let placed = CommandRecognizer::new(
            PathBuf::from("tesseract"),
            vec!["{image}".to_string(), "stdout".to_string()],
        );
        assert_eq!(
            placed.command_args(image),
            vec![OsString::from("/tmp/x.jpg"), OsString::from("stdout")]
        );
    }

    #[test]
    fn fake_recognizer_is_scripted_by_file_name() {
        let fake = FakeRecognizer::new()
            .with_output("a.jpg", &["hello"], &["96385074"])
            .with_unreadable("b.jpg", "truncated");

        let out = fake.recognize(Path::new("/x/a.jpg")).unwrap();
        assert_eq!(out.barcode_decodes, vec!["96385074".to_string()]);
        assert!(matches!(
            fake.recognize(Path::new("/x/b.jpg")),
            Err(RecognitionError::Unreadable(_))
        ));
        assert_eq!(fake.recognize(Path::new("/x/c.jpg")).unwrap(), RawRecognition::default());
        assert_eq!(fake.calls(), 3);
        assert_eq!(fake.calls_for("a.jpg"), 1);
    }

    #[test]
    fn timeout_wrapper_gives_up_on_slow_engine() {
        let fake: Arc<dyn Recognizer> = Arc::new(FakeRecognizer::new().with_delay(
            "slow.jpg",
            Duration::from_millis(500),
            &["late"],
        ));
        let err = recognize_with_timeout(&fake, Path::new("slow.jpg"), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, RecognitionError::TimedOut(_)));

        let ok = recognize_with_timeout(&fake, Path::new("fast.jpg"), Duration::from_secs(5));
        assert!(ok.is_ok());
    }

    #[cfg(unix)]
    mod command {
        use super::*;
        use std::fs;
        use std::time::{SystemTime, UNIX_EPOCH};

        fn temp_dir(name: &str) -> PathBuf {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos();
            std::env::temp_dir().join(format!(
                "shelfcheck_recognizer_test_{}_{}_{}",
                std::process::id(),
                nanos,
                name
            ))
        }

        fn write_script(path: &Path, body: &str) -> anyhow::Result<()> {
            use std::os::unix::fs::PermissionsExt;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, body)?;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(path, perms)?;
            Ok(())
        }

        #[test]
        fn command_recognizer_reads_json_stdout() -> anyhow::Result<()> {
            let base = temp_dir("json");
            let script = base.join("recognize");
            write_script(
                &script,
                r#"#!/bin/sh
case "$1" in
  *epson_black.jpg)
    echo '{"text_blocks": ["EPSON 03C Black Ink"], "barcode_decodes": ["8885007027531"]}'
    ;;
  *)
    echo "unknown image $1" >&2
    exit 4
    ;;
esac
"#,
            )?;

            let recognizer = CommandRecognizer::new(script, Vec::new());
            let out = recognizer.recognize(&base.join("epson_black.jpg"))?;
            assert_eq!(out.barcode_decodes, vec!["8885007027531".to_string()]);

            let err = recognizer.recognize(&base.join("other.jpg")).unwrap_err();
            assert!(matches!(err, RecognitionError::Unreadable(ref m) if m.contains("unknown image")));

            let _ = fs::remove_dir_all(base);
            Ok(())
        }

        #[test]
        fn command_recognizer_reports_engine_failure_and_missing_program() -> anyhow::Result<()> {
            let base = temp_dir("fail");
            let script = base.join("recognize");
            write_script(
                &script,
                r#"#!/bin/sh
echo "model weights missing" >&2
exit 1
"#,
            )?;

            let err = CommandRecognizer::new(script, Vec::new())
                .recognize(Path::new("a.png"))
                .unwrap_err()
                .to_string();
            assert!(err.contains("recognition engine failed"));
            assert!(err.contains("model weights missing"));

            let missing = CommandRecognizer::new(base.join("nope"), Vec::new())
                .recognize(Path::new("a.png"))
                .unwrap_err();
            assert!(matches!(missing, RecognitionError::Launch { .. }));

            let _ = fs::remove_dir_all(base);
            Ok(())
        }

        #[test]
        fn command_recognizer_kills_engine_past_deadline() -> anyhow::Result<()> {
            let base = temp_dir("deadline");
            let script = base.join("recognize");
            let marker = base.join("finished");
            write_script(
                &script,
                &format!("#!/bin/sh\nsleep 2\ntouch '{}'\n", marker.display()),
            )?;

            let recognizer =
                CommandRecognizer::new(script, Vec::new()).with_timeout(Duration::from_millis(100));
            let started = Instant::now();
            let err = recognizer.recognize(Path::new("slow.jpg")).unwrap_err();
            assert!(matches!(err, RecognitionError::TimedOut(_)));
            assert!(started.elapsed() < Duration::from_secs(2));

            std::thread::sleep(Duration::from_secs(3));
            assert!(!marker.exists(), "engine kept running after the deadline");

            let _ = fs::remove_dir_all(base);
            Ok(())
        }

        #[test]
        fn command_recognizer_within_deadline_returns_output() -> anyhow::Result<()> {
            let base = temp_dir("in_time");
            let script = base.join("recognize");
            write_script(&script, "#!/bin/sh\necho 'HP Toner'\n")?;

            let out = CommandRecognizer::new(script, Vec::new())
                .with_timeout(Duration::from_secs(10))
                .recognize(Path::new("plain.png"))?;
            assert_eq!(out.text_blocks, vec!["HP Toner".to_string()]);

            let _ = fs::remove_dir_all(base);
            Ok(())
        }
    }
}

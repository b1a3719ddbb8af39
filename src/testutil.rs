//! Fake `sudo` used by the session, sampler and elevation tests.

use crate::elevation::Elevation;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// What the fake does when asked to sample (`-n ...`).
pub enum SampleBehavior {
    /// Print the text on stdout and exit 0. Must not contain single quotes.
    Print(&'static str),
    /// Print to stderr and exit 1, like sudo with an expired grant.
    Fail,
    /// Print the text on stdout, then exit 1.
    PrintThenFail(&'static str),
    /// Take about 300ms, then print the text and exit 0.
    Slow(&'static str),
    /// Never finish on its own.
    Hang,
    /// Run `sleep` in the background and wait for it, forwarding SIGTERM the
    /// way sudo relays it. The grandchild's pid is written to `grandchild`.
    Relay,
}

/// A shell script standing in for `sudo`, run as `sh <script>`.
///
/// `-S` reads one line from stdin and accepts it only if it equals the
/// `password` given to [`FakeSudo::new`].
/// Every invocation is recorded in a calls file.
pub struct FakeSudo {
    dir: TempDir,
    script: PathBuf,
    calls: PathBuf,
}

impl FakeSudo {
    pub fn new(password: &str, behavior: SampleBehavior) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-sudo.sh");
        let calls = dir.path().join("calls");

        let sample_body = match behavior {
            SampleBehavior::Print(text) => format!("printf '%s\\n' '{text}'\n    exit 0"),
            SampleBehavior::Fail => {
                "echo 'sudo: a password is required' >&2\n    exit 1".to_string()
            }
            SampleBehavior::PrintThenFail(text) => format!("printf '%s\\n' '{text}'\n    exit 1"),
            SampleBehavior::Slow(text) => {
                format!("sleep 0.3\n    printf '%s\\n' '{text}'\n    exit 0")
            }
            SampleBehavior::Hang => "exec sleep 30".to_string(),
            SampleBehavior::Relay => format!(
                "trap 'kill \"$child\" 2>/dev/null; exit 143' TERM\n    \
                 sleep 77 &\n    \
                 child=$!\n    \
                 echo \"$child\" > '{}'\n    \
                 wait \"$child\"\n    \
                 exit 0",
                dir.path().join("grandchild").display()
            ),
        };

        let body = format!(
            r#"calls='{calls}'
case "$1" in
  -S)
    echo validate >> "$calls"
    IFS= read -r pw || exit 1
    [ "$pw" = '{password}' ] || {{ echo 'Sorry, try again.' >&2; exit 1; }}
    exit 0
    ;;
  -n)
    echo sample >> "$calls"
    {sample_body}
    ;;
esac
exit 2
"#,
            calls = calls.display(),
        );
        std::fs::write(&script, body).unwrap();

        Self { dir, script, calls }
    }

    pub fn elevation(&self) -> Elevation {
        Elevation::new(
            "sh",
            vec![self.script.display().to_string()],
            Duration::from_secs(10),
        )
    }

    /// Scratch directory that lives as long as the fake.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.path().join("gpu_power.txt")
    }

    /// Pid of the background process started by `SampleBehavior::Relay`.
    pub fn grandchild_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.dir.path().join("grandchild"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn validations(&self) -> usize {
        self.count("validate")
    }

    pub fn samples(&self) -> usize {
        self.count("sample")
    }

    fn count(&self, kind: &str) -> usize {
        std::fs::read_to_string(&self.calls)
            .unwrap_or_default()
            .lines()
            .filter(|l| *l == kind)
            .count()
    }
}

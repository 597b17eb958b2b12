//! Playback sink: hands finished narration to an external player process.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info};

pub struct Player {
    binary: String,
    process: Option<Child>,
}

impl Player {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            process: None,
        }
    }

    /// Start playing `url`, replacing whatever is playing.
    pub fn play(&mut self, url: &str) -> anyhow::Result<()> {
        self.stop();
        let child = Command::new(&self.binary)
            .arg("--no-video")
            .arg("--quiet")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!("player: {} pid {:?} playing {}", self.binary, child.id(), url);
        self.process = Some(child);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut child) = self.process.take() {
            debug!("player: stopping pid {:?}", child.id());
            let _ = child.start_kill();
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Display hardware presets and the backends that put content on screen.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use super::error::{AgentError, AgentResult};
use crate::protocol::{Artifact, ResolvedItem, TransitionType, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisplayType {
    #[serde(rename = "looking_glass_portrait")]
    LookingGlassPortrait,
    #[serde(rename = "looking_glass_16")]
    LookingGlass16,
    #[serde(rename = "looking_glass_32")]
    LookingGlass32,
    #[serde(rename = "looking_glass_65")]
    LookingGlass65,
    #[serde(rename = "hypervsn_solo")]
    HypervsnSolo,
    #[serde(rename = "web_emulator")]
    WebEmulator,
}

/// Native resolution and quilt geometry of a display model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayPreset {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub quilt_views: Option<u32>,
    pub quilt_depth: Option<u32>,
}

impl DisplayType {
    pub const ALL: [DisplayType; 6] = [
        DisplayType::LookingGlassPortrait,
        DisplayType::LookingGlass16,
        DisplayType::LookingGlass32,
        DisplayType::LookingGlass65,
        DisplayType::HypervsnSolo,
        DisplayType::WebEmulator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayType::LookingGlassPortrait => "looking_glass_portrait",
            DisplayType::LookingGlass16 => "looking_glass_16",
            DisplayType::LookingGlass32 => "looking_glass_32",
            DisplayType::LookingGlass65 => "looking_glass_65",
            DisplayType::HypervsnSolo => "hypervsn_solo",
            DisplayType::WebEmulator => "web_emulator",
        }
    }

    pub fn preset(&self) -> DisplayPreset {
        let looking_glass = |name, side| DisplayPreset {
            name,
            width: side,
            height: side,
            quilt_views: Some(48),
            quilt_depth: Some(45),
        };
        match self {
            DisplayType::LookingGlassPortrait => looking_glass("Looking Glass Portrait", 2048),
            DisplayType::LookingGlass16 => looking_glass("Looking Glass 16\"", 4096),
            DisplayType::LookingGlass32 => looking_glass("Looking Glass 32\"", 8192),
            DisplayType::LookingGlass65 => looking_glass("Looking Glass 65\"", 8192),
            DisplayType::HypervsnSolo => DisplayPreset {
                name: "HYPERVSN Solo",
                width: 1920,
                height: 1080,
                quilt_views: None,
                quilt_depth: None,
            },
            DisplayType::WebEmulator => DisplayPreset {
                name: "Web emulator",
                width: 1920,
                height: 1080,
                quilt_views: None,
                quilt_depth: None,
            },
        }
    }

    fn is_looking_glass(&self) -> bool {
        self.preset().quilt_views.is_some()
    }

    /// Picks the artifact this display should download for `item`, falling
    /// back to the original upload when no processed output fits.
    pub fn select_artifact<'a>(&self, item: &'a ResolvedItem) -> (&'a Artifact, Option<QuiltLayout>) {
        let outputs = &item.outputs;
        if self.is_looking_glass() {
            let wanted = self.preset().quilt_views;
            let quilt = outputs
                .quilts
                .iter()
                .find(|q| Some(q.views) == wanted)
                .or_else(|| outputs.quilts.first());
            if let Some(q) = quilt {
                let layout = QuiltLayout {
                    views: q.views,
                    columns: q.columns,
                    rows: q.rows,
                };
                return (&q.artifact, Some(layout));
            }
        }
        let artifact = match self {
            DisplayType::HypervsnSolo => outputs.video.as_ref(),
            _ => None,
        }
        .or(outputs.optimized_model.as_ref())
        .or(outputs.compressed_model.as_ref())
        .unwrap_or(&item.source);
        (artifact, None)
    }
}

impl fmt::Display for DisplayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisplayType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DisplayType::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuiltLayout {
    pub views: u32,
    pub columns: u32,
    pub rows: u32,
}

/// Something the player can put on screen: a verified local file plus how
/// long and how to show it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableItem {
    pub asset_id: String,
    pub path: PathBuf,
    pub duration: Duration,
    pub transition: TransitionType,
    pub transition_ms: u64,
    pub quilt: Option<QuiltLayout>,
}

// ─── Backends ────────────────────────────────────────────────────────────────

pub trait DisplayBackend: Send {
    fn initialize(&mut self) -> AgentResult<()>;
    fn show(&mut self, item: &PlayableItem) -> AgentResult<()>;
    /// PNG bytes of the current frame, if the backend can capture one.
    fn screenshot(&mut self) -> AgentResult<Option<Vec<u8>>>;
    fn shutdown(&mut self);
}

/// Logs what it would show. Used in simulation mode and tests.
#[derive(Debug, Default)]
pub struct SimulatedDisplay {
    pub shown: Vec<String>,
    pub initialized: bool,
}

impl DisplayBackend for SimulatedDisplay {
    fn initialize(&mut self) -> AgentResult<()> {
        self.initialized = true;
        tracing::info!("Simulated display initialized");
        Ok(())
    }

    fn show(&mut self, item: &PlayableItem) -> AgentResult<()> {
        tracing::info!(
            asset_id = %item.asset_id,
            path = %item.path.display(),
            duration_secs = item.duration.as_secs(),
            transition = item.transition.as_str(),
            "[simulation] showing item"
        );
        self.shown.push(item.asset_id.clone());
        Ok(())
    }

    fn screenshot(&mut self) -> AgentResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn shutdown(&mut self) {
        self.initialized = false;
    }
}

/// Hands each item to an external viewer process (the vendor's renderer),
/// replacing the previous process on every change.
pub struct ExternalViewerDisplay {
    program: PathBuf,
    args: Vec<String>,
    display: DisplayType,
    child: Option<tokio::process::Child>,
}

impl ExternalViewerDisplay {
    /// `command` is split on whitespace; the first word is looked up on PATH.
    pub fn new(command: &str, display: DisplayType) -> AgentResult<Self> {
        let mut words = command.split_whitespace();
        let name = words
            .next()
            .ok_or_else(|| AgentError::Protocol("viewer_command is empty".into()))?;
        let program = which::which(name).map_err(|e| {
            AgentError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("viewer {name:?} not found: {e}"),
            ))
        })?;
        Ok(ExternalViewerDisplay {
            program,
            args: words.map(str::to_string).collect(),
            display,
            child: None,
        })
    }

    fn stop_current(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Viewer already gone: {}", e);
            }
        }
    }
}

impl DisplayBackend for ExternalViewerDisplay {
    fn initialize(&mut self) -> AgentResult<()> {
        tracing::info!(
            viewer = %self.program.display(),
            display = %self.display,
            "External viewer backend ready"
        );
        Ok(())
    }

    fn show(&mut self, item: &PlayableItem) -> AgentResult<()> {
        self.stop_current();
        let preset = self.display.preset();

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&item.path)
            .env("HOLOHUB_DISPLAY_TYPE", self.display.as_str())
            .env("HOLOHUB_RESOLUTION", format!("{}x{}", preset.width, preset.height))
            .env("HOLOHUB_TRANSITION", item.transition.as_str())
            .env("HOLOHUB_TRANSITION_MS", item.transition_ms.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(q) = item.quilt {
            cmd.env("HOLOHUB_QUILT", format!("{}x{}x{}", q.columns, q.rows, q.views));
        }
        if let Some(depth) = preset.quilt_depth {
            cmd.env("HOLOHUB_QUILT_DEPTH", depth.to_string());
        }

        let child = cmd.spawn()?;
        tracing::debug!(pid = ?child.id(), asset_id = %item.asset_id, "Viewer spawned");
        self.child = Some(child);
        Ok(())
    }

    fn screenshot(&mut self) -> AgentResult<Option<Vec<u8>>> {
        // The viewer protocol has no capture hook.
        Ok(None)
    }

    fn shutdown(&mut self) {
        self.stop_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AssetOutputs, QuiltArtifact};

    fn art(name: &str) -> Artifact {
        Artifact {
            url: format!("https://cdn.example/{name}"),
            size: 1,
            sha256: "0".repeat(64),
        }
    }

    fn item(outputs: AssetOutputs) -> ResolvedItem {
        ResolvedItem {
            id: "i".into(),
            asset_id: "a".into(),
            position: 0,
            duration_seconds: 10,
            transition_override: None,
            mime_type: "model/gltf-binary".into(),
            source: art("source"),
            outputs,
        }
    }

    #[test]
    fn names_round_trip() {
        for d in DisplayType::ALL {
            assert_eq!(d.as_str().parse::<DisplayType>().unwrap(), d);
            let json = serde_json::to_string(&d).unwrap();
            assert_eq!(json, format!("\"{}\"", d.as_str()));
        }
        assert!("crt".parse::<DisplayType>().is_err());
    }

    #[test]
    fn presets_match_hardware() {
        assert_eq!(DisplayType::LookingGlassPortrait.preset().width, 2048);
        assert_eq!(DisplayType::LookingGlass65.preset().height, 8192);
        assert_eq!(DisplayType::LookingGlass16.preset().quilt_views, Some(48));
        assert_eq!(DisplayType::HypervsnSolo.preset().quilt_views, None);
    }

    #[test]
    fn looking_glass_prefers_matching_quilt() {
        let outputs = AssetOutputs {
            optimized_model: Some(art("model")),
            quilts: vec![
                QuiltArtifact {
                    artifact: art("q45"),
                    views: 45,
                    columns: 5,
                    rows: 9,
                },
                QuiltArtifact {
                    artifact: art("q48"),
                    views: 48,
                    columns: 8,
                    rows: 6,
                },
            ],
            ..Default::default()
        };
        let it = item(outputs);
        let (a, layout) = DisplayType::LookingGlassPortrait.select_artifact(&it);
        assert!(a.url.ends_with("q48"));
        assert_eq!(layout.unwrap().columns, 8);
    }

    #[test]
    fn fan_display_prefers_video_then_falls_back_to_source() {
        let with_video = item(AssetOutputs {
            video: Some(art("video")),
            optimized_model: Some(art("model")),
            ..Default::default()
        });
        let (a, layout) = DisplayType::HypervsnSolo.select_artifact(&with_video);
        assert!(a.url.ends_with("video"));
        assert!(layout.is_none());

        let bare = item(AssetOutputs::default());
        let (a, _) = DisplayType::HypervsnSolo.select_artifact(&bare);
        assert!(a.url.ends_with("source"));
    }

    #[test]
    fn simulated_display_records_items() {
        let mut d = SimulatedDisplay::default();
        d.initialize().unwrap();
        d.show(&PlayableItem {
            asset_id: "a1".into(),
            path: PathBuf::from("/tmp/x"),
            duration: Duration::from_secs(1),
            transition: TransitionType::Cut,
            transition_ms: 0,
            quilt: None,
        })
        .unwrap();
        assert_eq!(d.shown, vec!["a1".to_string()]);
        assert_eq!(d.screenshot().unwrap(), None);
    }
}

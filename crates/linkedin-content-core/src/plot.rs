//! Static diagram of the flow: the three stages plus the tasks each crew runs.

use std::fmt::Write as _;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::crew::CrewConfigSet;
use crate::crews::{CrewKind, load_crew_configs};
use crate::workflow::FLOW_NAME;

pub const DEFAULT_PLOT_FILE: &str = "linkedin_content_flow.html";

const STAGES: [&str; 3] = ["get_user_input", "research", "content"];

#[derive(Debug, Clone)]
struct CrewLane {
    stage: &'static str,
    crew: &'static str,
    steps: Vec<(String, String)>,
}

/// Mermaid view of the flow, independent of any LLM or search client.
#[derive(Debug, Clone)]
pub struct FlowDiagram {
    lanes: Vec<CrewLane>,
}

impl FlowDiagram {
    /// Load crew definitions from `crew_config_dir` or the built-in YAML.
    pub fn load(crew_config_dir: Option<&Path>) -> Result<Self> {
        let research = load_crew_configs(CrewKind::Research, crew_config_dir)?;
        let content = load_crew_configs(CrewKind::Content, crew_config_dir)?;
        Ok(Self {
            lanes: vec![
                lane("research", CrewKind::Research, &research),
                lane("content", CrewKind::Content, &content),
            ],
        })
    }

    pub fn render_mermaid(&self) -> String {
        let mut output = String::from("flowchart TD\n");
        for stage in STAGES {
            let _ = writeln!(output, "  {stage}([\"{stage}\"])");
        }
        for pair in STAGES.windows(2) {
            let _ = writeln!(output, "  {} --> {}", pair[0], pair[1]);
        }

        for lane in &self.lanes {
            let _ = writeln!(output, "  subgraph {}", lane.crew);
            for (task_id, role) in &lane.steps {
                let label = sanitize_mermaid(&format!("{task_id}\n{role}"));
                let _ = writeln!(output, "    {}_{task_id}[\"{label}\"]", lane.crew);
            }
            for pair in lane.steps.windows(2) {
                let _ = writeln!(
                    output,
                    "    {crew}_{} --> {crew}_{}",
                    pair[0].0,
                    pair[1].0,
                    crew = lane.crew
                );
            }
            output.push_str("  end\n");
            let _ = writeln!(output, "  {} -.-> {}", lane.stage, lane.crew);
        }

        output
    }

    pub fn render_html(&self) -> String {
        format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
             <title>{FLOW_NAME}</title>\n\
             <script type=\"module\">\n\
             import mermaid from \"https://cdn.jsdelivr.net/npm/mermaid@10/dist/mermaid.esm.min.mjs\";\n\
             mermaid.initialize({{ startOnLoad: true }});\n\
             </script>\n</head>\n<body>\n<h1>{FLOW_NAME}</h1>\n\
             <pre class=\"mermaid\">\n{}</pre>\n</body>\n</html>\n",
            self.render_mermaid()
        )
    }

    /// Write the HTML page, creating parent directories as needed.
    pub fn write_html(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        fs::write(path, self.render_html())
            .with_context(|| format!("failed to write flow plot {}", path.display()))?;
        Ok(path.to_path_buf())
    }
}

fn lane(stage: &'static str, kind: CrewKind, configs: &CrewConfigSet) -> CrewLane {
    let steps = kind
        .task_ids()
        .iter()
        .map(|task_id| {
            let role = configs
                .tasks
                .get(*task_id)
                .and_then(|task| configs.agents.get(&task.agent))
                .map(|agent| agent.role.trim().to_string())
                .unwrap_or_default();
            (task_id.to_string(), role)
        })
        .collect();
    CrewLane {
        stage,
        crew: kind.name(),
        steps,
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "#quot;")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

//! The two crews of the flow: research (researcher + fact checker) and content
//! (writer + editor). Personas and prompts come from YAML; wiring lives here.

use std::path::{Path, PathBuf};

use crate::crew::{Agent, Crew, CrewConfigSet, CrewError, CrewTask};
use crate::llm::DynLlmClient;
use crate::schema::ResearchReport;
use crate::search::DynSearchTool;

pub const RESEARCHER: &str = "researcher";
pub const FACT_CHECKER: &str = "fact_checker";
pub const RESEARCH_TASK: &str = "research_task";
pub const FACT_CHECKING_TASK: &str = "fact_checking_task";

pub const CONTENT_WRITER: &str = "content_writer";
pub const CONTENT_EDITOR: &str = "content_editor";
pub const DRAFTING_TASK: &str = "drafting_task";
pub const EDITING_TASK: &str = "editing_task";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrewKind {
    Research,
    Content,
}

impl CrewKind {
    pub fn name(&self) -> &'static str {
        match self {
            CrewKind::Research => "research_crew",
            CrewKind::Content => "content_crew",
        }
    }

    /// Sub-directory holding this crew's YAML inside an override directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            CrewKind::Research => "research",
            CrewKind::Content => "content",
        }
    }

    /// Task ids in execution order.
    pub fn task_ids(&self) -> [&'static str; 2] {
        match self {
            CrewKind::Research => [RESEARCH_TASK, FACT_CHECKING_TASK],
            CrewKind::Content => [DRAFTING_TASK, EDITING_TASK],
        }
    }

    fn embedded_yaml(&self) -> (&'static str, &'static str) {
        match self {
            CrewKind::Research => (
                include_str!("../config/research/agents.yaml"),
                include_str!("../config/research/tasks.yaml"),
            ),
            CrewKind::Content => (
                include_str!("../config/content/agents.yaml"),
                include_str!("../config/content/tasks.yaml"),
            ),
        }
    }
}

/// Load a crew's configuration from `<dir>/<research|content>/` or the built-in defaults.
pub fn load_crew_configs(
    kind: CrewKind,
    override_dir: Option<&Path>,
) -> Result<CrewConfigSet, CrewError> {
    match override_dir {
        Some(dir) => CrewConfigSet::load(&dir.join(kind.dir_name())),
        None => {
            let (agents, tasks) = kind.embedded_yaml();
            CrewConfigSet::from_yaml(agents, tasks)
        }
    }
}

/// Where crews write their artefacts and how much search context they pull.
#[derive(Debug, Clone)]
pub struct CrewSettings {
    pub base_dir: PathBuf,
    pub research_output: PathBuf,
    pub content_output: PathBuf,
    pub search_results: u32,
}

impl Default for CrewSettings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            research_output: PathBuf::from("output/research_result.json"),
            content_output: PathBuf::from("content_result.txt"),
            search_results: 5,
        }
    }
}

pub fn research_crew(
    configs: &CrewConfigSet,
    llm: DynLlmClient,
    search: DynSearchTool,
    settings: &CrewSettings,
) -> Result<Crew, CrewError> {
    let crew = CrewKind::Research.name();

    Crew::new(crew, llm)
        .with_agent(
            Agent::new(RESEARCHER, configs.agent(crew, RESEARCHER)?).with_tool(search.clone()),
        )
        .with_agent(Agent::new(FACT_CHECKER, configs.agent(crew, FACT_CHECKER)?).with_tool(search))
        .with_task(CrewTask::new(RESEARCH_TASK, configs.task(crew, RESEARCH_TASK)?))
        .with_task(
            CrewTask::new(FACT_CHECKING_TASK, configs.task(crew, FACT_CHECKING_TASK)?)
                .with_context(RESEARCH_TASK)
                .with_output_schema(ResearchReport::response_schema())
                .with_output_file(&settings.research_output),
        )
        .with_base_dir(&settings.base_dir)
        .with_search_results(settings.search_results)
        .validate()
}

pub fn content_crew(
    configs: &CrewConfigSet,
    llm: DynLlmClient,
    settings: &CrewSettings,
) -> Result<Crew, CrewError> {
    let crew = CrewKind::Content.name();

    Crew::new(crew, llm)
        .with_agent(Agent::new(CONTENT_WRITER, configs.agent(crew, CONTENT_WRITER)?))
        .with_agent(Agent::new(CONTENT_EDITOR, configs.agent(crew, CONTENT_EDITOR)?))
        .with_task(CrewTask::new(DRAFTING_TASK, configs.task(crew, DRAFTING_TASK)?))
        .with_task(
            CrewTask::new(EDITING_TASK, configs.task(crew, EDITING_TASK)?)
                .with_context(DRAFTING_TASK)
                .with_output_file(&settings.content_output),
        )
        .with_base_dir(&settings.base_dir)
        .validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::search::StubSearch;
    use std::sync::Arc;

    #[test]
    fn embedded_configs_parse() {
        let research = load_crew_configs(CrewKind::Research, None).unwrap();
        assert!(research.agents.contains_key(RESEARCHER));
        assert_eq!(research.task("r", FACT_CHECKING_TASK).unwrap().agent, FACT_CHECKER);

        let content = load_crew_configs(CrewKind::Content, None).unwrap();
        assert!(
            content
                .task("c", DRAFTING_TASK)
                .unwrap()
                .description
                .contains("{research_report}")
        );
    }

    #[test]
    fn builds_both_crews_with_expected_wiring() {
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let settings = CrewSettings::default();

        let research = research_crew(
            &load_crew_configs(CrewKind::Research, None).unwrap(),
            llm.clone(),
            Arc::new(StubSearch::new(vec![])),
            &settings,
        )
        .unwrap();
        let ids: Vec<_> = research.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![RESEARCH_TASK, FACT_CHECKING_TASK]);
        assert!(research.tasks()[1].output_json);
        assert_eq!(
            research.tasks()[1].output_schema,
            Some(ResearchReport::response_schema())
        );
        assert!(research.tasks()[0].output_schema.is_none());
        assert_eq!(research.agent(RESEARCHER).unwrap().tools.len(), 1);

        let content = content_crew(
            &load_crew_configs(CrewKind::Content, None).unwrap(),
            llm,
            &settings,
        )
        .unwrap();
        assert_eq!(
            content.tasks()[1].output_file.as_deref(),
            Some(Path::new("content_result.txt"))
        );
        assert!(content.agent(CONTENT_WRITER).unwrap().tools.is_empty());
    }

    #[test]
    fn override_dir_must_contain_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_crew_configs(CrewKind::Content, Some(dir.path())).unwrap_err();
        assert!(matches!(err, CrewError::ConfigIo { .. }));
    }
}

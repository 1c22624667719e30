use super::*;

#[test]
fn default_config_is_valid() {
    let config = RagConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.effective_embedding_model(), DEFAULT_EMBEDDING_MODEL);
}

#[test]
fn blank_embedding_model_falls_back_to_default() {
    let config = RagConfig {
        embedding_model: "  ".to_string(),
        ..RagConfig::default()
    };
    assert_eq!(config.effective_embedding_model(), DEFAULT_EMBEDDING_MODEL);

    let config = RagConfig {
        embedding_model: "mxbai-embed-large".to_string(),
        ..RagConfig::default()
    };
    assert_eq!(config.effective_embedding_model(), "mxbai-embed-large");
}

#[test]
fn score_bounds_are_validated() {
    let config = RagConfig {
        similarity_threshold: -0.1,
        ..RagConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidScore {
            field: "similarity_threshold",
            ..
        })
    ));

    let config = RagConfig {
        min_support_quality_score: 1.01,
        ..RagConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn grader_parallelism_bounds() {
    for (value, ok) in [(0, false), (1, true), (32, true), (33, false)] {
        let config = RagConfig {
            grader_parallel_processing: value,
            ..RagConfig::default()
        };
        assert_eq!(config.validate().is_ok(), ok, "parallelism {}", value);
    }
}

#[test]
fn dedicated_grader_requires_model() {
    let config = RagConfig {
        grader_model_source: GraderModelSource::Dedicated,
        ..RagConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::MissingGraderModel)
    ));

    let config = RagConfig {
        grader_model_source: GraderModelSource::Dedicated,
        grader_model: Some("qwen2.5:3b".to_string()),
        ..RagConfig::default()
    };
    assert!(config.validate().is_ok());
}

#[test]
fn file_type_filter() {
    let config = RagConfig::default();
    assert!(config.accepts_path("notes/alpha.md"));
    assert!(config.accepts_path("notes/ALPHA.MD"));
    assert!(!config.accepts_path("notes/alpha.txt"));
    assert!(!config.accepts_path("notes.d/README"));

    let config = RagConfig {
        file_types: vec![".md".to_string(), "txt".to_string()],
        ..RagConfig::default()
    };
    assert!(config.accepts_path("notes/alpha.txt"));
}

#[test]
fn folder_filters() {
    let config = RagConfig {
        include_folders: vec!["Projects/".to_string()],
        exclude_folders: vec!["Projects/Archive".to_string()],
        ..RagConfig::default()
    };

    assert!(config.accepts_path("Projects/alpha.md"));
    assert!(config.accepts_path("/Projects/beta/notes.md"));
    assert!(!config.accepts_path("Projects/Archive/old.md"));
    assert!(!config.accepts_path("ProjectsX/alpha.md"));
    assert!(!config.accepts_path("Daily/2024-01-01.md"));
}

#[test]
fn tag_filters() {
    let tags = vec!["project".to_string(), "alpha".to_string()];

    assert!(RagConfig::default().accepts_tags(&tags));
    assert!(RagConfig::default().accepts_tags(&[]));

    let include = RagConfig {
        include_tags: vec!["#Project".to_string()],
        ..RagConfig::default()
    };
    assert!(include.has_tag_filters());
    assert!(include.accepts_tags(&tags));
    assert!(!include.accepts_tags(&["journal".to_string()]));

    let exclude = RagConfig {
        include_tags: vec!["project".to_string()],
        exclude_tags: vec!["alpha".to_string()],
        ..RagConfig::default()
    };
    assert!(!exclude.accepts_tags(&tags));
}

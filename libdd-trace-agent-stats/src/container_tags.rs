// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lookup of the tags of a container, used to resolve the version data of client payloads.

use std::collections::HashMap;

const TAG_GIT_COMMIT_SHA: &str = "git.commit.sha";
const TAG_IMAGE_TAG: &str = "image_tag";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContainerTagsError {
    #[error("container {0} not found")]
    NotFound(String),
    #[error("container tags lookup failed: {0}")]
    Lookup(String),
}

/// Source of container tags, usually backed by the tagger of the host agent.
pub trait ContainerTagsProvider: Send + Sync {
    /// Return the tags of the container as `name:value` strings
    fn container_tags(&self, container_id: &str) -> Result<Vec<String>, ContainerTagsError>;
}

/// Provider returning tags from a fixed map.
#[derive(Debug, Default, Clone)]
pub struct StaticContainerTags {
    tags: HashMap<String, Vec<String>>,
}

impl StaticContainerTags {
    pub fn new(tags: HashMap<String, Vec<String>>) -> Self {
        Self { tags }
    }

    pub fn insert(&mut self, container_id: impl Into<String>, tags: Vec<String>) {
        self.tags.insert(container_id.into(), tags);
    }
}

impl ContainerTagsProvider for StaticContainerTags {
    fn container_tags(&self, container_id: &str) -> Result<Vec<String>, ContainerTagsError> {
        self.tags
            .get(container_id)
            .cloned()
            .ok_or_else(|| ContainerTagsError::NotFound(container_id.to_string()))
    }
}

/// Version data carried by the tags of a container
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VersionData<'a> {
    pub git_commit_sha: Option<&'a str>,
    pub image_tag: Option<&'a str>,
}

/// Extract the git commit sha and the image tag from a list of `name:value` tags
pub fn version_data_from_tags(tags: &[String]) -> VersionData<'_> {
    let mut data = VersionData::default();
    for tag in tags {
        match tag.split_once(':') {
            Some((TAG_GIT_COMMIT_SHA, value)) => data.git_commit_sha = Some(value),
            Some((TAG_IMAGE_TAG, value)) => data.image_tag = Some(value),
            _ => {}
        }
    }
    data
}

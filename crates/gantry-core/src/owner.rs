// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container identifiers and the owners they resolve to.
//!
//! Callers describe a container with a flat [`ContainerIdentifier`]. Before
//! anything touches the database it is validated into exactly one
//! [`ContainerOwner`] kind; ambiguous or underspecified identifiers are
//! rejected with [`DbError::InvalidIdentifier`], never treated as "not found".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DbError, Result};
use crate::resource_config::{ResourceConfigDescriptor, VersionedResourceType, hash_json};

/// Stage of a container. The same owner may have one container per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStage {
    /// Checking for new versions.
    Check,
    /// Fetching a version.
    Get,
    /// Running a step.
    Run,
}

impl ContainerStage {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Get => "get",
            Self::Run => "run",
        }
    }
}

impl fmt::Display for ContainerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "check" => Ok(Self::Check),
            "get" => Ok(Self::Get),
            "run" => Ok(Self::Run),
            other => Err(format!("unknown container stage '{}'", other)),
        }
    }
}

/// Image a resource container runs on, when not a worker base type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResource {
    /// Type used to fetch the image.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Source of the image.
    pub source: Value,
}

impl ImageResource {
    /// Hash of the image source.
    pub fn source_hash(&self) -> String {
        hash_json(&self.source)
    }
}

/// Flat, caller-supplied description of a container.
///
/// Three field groups exist: build step (`build_id`, `plan_id`), resource
/// (`resource_id`, `check_type`, `check_source`, `image_resource`,
/// `resource_cache_id`) and sub-container (`parent_container_id`). Exactly
/// one group must be populated, and `stage` is always required.
/// Resource get containers also need `resource_cache_id`, for both create
/// and lookup. Resource check containers must not carry one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerIdentifier {
    /// Stage of the container.
    pub stage: Option<ContainerStage>,

    /// Build owning a step container.
    pub build_id: Option<i64>,
    /// Plan node within the build.
    pub plan_id: Option<String>,

    /// Pipeline resource being checked or fetched, if any.
    pub resource_id: Option<i64>,
    /// Resource type to check or fetch with.
    pub check_type: Option<String>,
    /// Resource source.
    pub check_source: Option<Value>,
    /// Custom image for the container.
    pub image_resource: Option<ImageResource>,
    /// Cache being populated by a get container.
    pub resource_cache_id: Option<i64>,
    /// Custom types visible when resolving `check_type`.
    pub resource_types: Vec<VersionedResourceType>,

    /// Parent of an image check/get sub-container.
    pub parent_container_id: Option<i64>,

    /// Restricts lookups to one worker. Ignored on create.
    pub worker_name: Option<String>,
}

impl ContainerIdentifier {
    /// A build step container.
    pub fn build_step(build_id: i64, plan_id: impl Into<String>, stage: ContainerStage) -> Self {
        Self {
            stage: Some(stage),
            build_id: Some(build_id),
            plan_id: Some(plan_id.into()),
            ..Default::default()
        }
    }

    /// A resource check container.
    pub fn resource_check(check_type: impl Into<String>, check_source: Value) -> Self {
        Self {
            stage: Some(ContainerStage::Check),
            check_type: Some(check_type.into()),
            check_source: Some(check_source),
            ..Default::default()
        }
    }

    /// A resource get container populating `resource_cache_id`.
    pub fn resource_get(
        check_type: impl Into<String>,
        check_source: Value,
        resource_cache_id: i64,
    ) -> Self {
        Self {
            stage: Some(ContainerStage::Get),
            check_type: Some(check_type.into()),
            check_source: Some(check_source),
            resource_cache_id: Some(resource_cache_id),
            ..Default::default()
        }
    }

    /// An image check sub-container of `parent_container_id`.
    pub fn image_check(parent_container_id: i64) -> Self {
        Self {
            stage: Some(ContainerStage::Check),
            parent_container_id: Some(parent_container_id),
            ..Default::default()
        }
    }

    /// An image get sub-container of `parent_container_id`.
    pub fn image_get(parent_container_id: i64) -> Self {
        Self {
            stage: Some(ContainerStage::Get),
            parent_container_id: Some(parent_container_id),
            ..Default::default()
        }
    }

    /// Attach the pipeline resource id.
    pub fn with_resource_id(mut self, resource_id: i64) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    /// Attach a custom image.
    pub fn with_image_resource(mut self, image: ImageResource) -> Self {
        self.image_resource = Some(image);
        self
    }

    /// Attach the custom types visible to the resource.
    pub fn with_resource_types(mut self, types: Vec<VersionedResourceType>) -> Self {
        self.resource_types = types;
        self
    }

    /// Restrict lookups to one worker.
    pub fn on_worker(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = Some(worker_name.into());
        self
    }

    fn has_build_fields(&self) -> bool {
        self.build_id.is_some() || self.plan_id.is_some()
    }

    fn has_resource_fields(&self) -> bool {
        self.resource_id.is_some()
            || self.check_type.is_some()
            || self.check_source.is_some()
            || self.image_resource.is_some()
            || self.resource_cache_id.is_some()
    }

    fn has_parent_fields(&self) -> bool {
        self.parent_container_id.is_some()
    }

    /// Validate into exactly one owner kind.
    pub fn owner(&self) -> Result<ContainerOwner> {
        let groups = [
            self.has_build_fields(),
            self.has_resource_fields(),
            self.has_parent_fields(),
        ];
        match groups.iter().filter(|present| **present).count() {
            0 => return Err(invalid("no owner fields supplied")),
            1 => {}
            _ => return Err(invalid("owner fields from more than one kind supplied")),
        }

        let stage = self.stage.ok_or_else(|| invalid("stage is required"))?;

        if self.has_build_fields() {
            let (Some(build_id), Some(plan_id)) = (self.build_id, self.plan_id.clone()) else {
                return Err(invalid("build step requires build_id and plan_id"));
            };
            return Ok(ContainerOwner::BuildStep {
                build_id,
                plan_id,
                stage,
            });
        }

        if let Some(parent_container_id) = self.parent_container_id {
            let kind = match stage {
                ContainerStage::Check => SubContainerKind::ImageCheck,
                ContainerStage::Get => SubContainerKind::ImageGet,
                ContainerStage::Run => {
                    return Err(invalid("sub-containers exist only for check and get"));
                }
            };
            return Ok(ContainerOwner::ParentContainer {
                parent_container_id,
                kind,
            });
        }

        let (Some(check_type), Some(check_source)) = (&self.check_type, &self.check_source) else {
            return Err(invalid("resource owner requires check_type and check_source"));
        };
        match (stage, self.resource_cache_id) {
            (ContainerStage::Run, _) => return Err(invalid("resource owners run only check or get")),
            (ContainerStage::Check, Some(_)) => {
                return Err(invalid("resource_cache_id only applies to get containers"));
            }
            (ContainerStage::Get, None) => {
                return Err(invalid("get containers require resource_cache_id"));
            }
            _ => {}
        }

        Ok(ContainerOwner::Resource {
            resource_id: self.resource_id,
            config: ResourceConfigDescriptor::new(
                check_type,
                check_source.clone(),
                &self.resource_types,
            )?,
            image_resource: self.image_resource.clone(),
            resource_cache_id: self.resource_cache_id,
            stage,
        })
    }
}

fn invalid(reason: &str) -> DbError {
    DbError::InvalidIdentifier(reason.to_string())
}

/// Kind of sub-container owned by another container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubContainerKind {
    /// Checks the parent's custom image.
    ImageCheck,
    /// Fetches the parent's custom image.
    ImageGet,
}

impl SubContainerKind {
    /// Stage the sub-container runs in.
    pub fn stage(&self) -> ContainerStage {
        match self {
            Self::ImageCheck => ContainerStage::Check,
            Self::ImageGet => ContainerStage::Get,
        }
    }
}

/// A validated container owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerOwner {
    /// A step of a build.
    BuildStep {
        /// Build id.
        build_id: i64,
        /// Plan node.
        plan_id: String,
        /// Stage.
        stage: ContainerStage,
    },
    /// A resource check or get.
    Resource {
        /// Pipeline resource, if any.
        resource_id: Option<i64>,
        /// Resolved config of the resource type and source.
        config: ResourceConfigDescriptor,
        /// Custom image, if any.
        image_resource: Option<ImageResource>,
        /// Cache populated by a get container; `None` for checks.
        resource_cache_id: Option<i64>,
        /// Check or Get.
        stage: ContainerStage,
    },
    /// An image check/get sub-container.
    ParentContainer {
        /// Parent row id.
        parent_container_id: i64,
        /// Kind of sub-container.
        kind: SubContainerKind,
    },
}

impl ContainerOwner {
    /// Stage of containers with this owner.
    pub fn stage(&self) -> ContainerStage {
        match self {
            Self::BuildStep { stage, .. } | Self::Resource { stage, .. } => *stage,
            Self::ParentContainer { kind, .. } => kind.stage(),
        }
    }
}

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A Cloud Spanner resource addressed by a `projects/...` path.
pub trait SpannerResource {
    fn resources_id(&self) -> String;
    fn name(&self) -> &str;
    fn id(&self) -> String {
        format!("{}/{}", self.resources_id(), self.name())
    }
    fn url_path(&self) -> String {
        format!("/v1/{}", self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId {
    project: String,
    name: String,
}

impl InstanceId {
    pub fn new(project: &str, name: &str) -> Self {
        Self {
            project: project.to_string(),
            name: name.to_string(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }
}

impl SpannerResource for InstanceId {
    fn name(&self) -> &str {
        &self.name
    }

    fn resources_id(&self) -> String {
        format!("projects/{}/instances", self.project)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseId(InstanceId, String);

impl DatabaseId {
    pub fn new(instance: InstanceId, name: &str) -> Self {
        Self(instance, name.to_string())
    }

    pub fn instance(&self) -> &InstanceId {
        &self.0
    }
}

impl SpannerResource for DatabaseId {
    fn name(&self) -> &str {
        &self.1
    }

    fn resources_id(&self) -> String {
        format!("{}/databases", self.0.id())
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl FromStr for DatabaseId {
    type Err = Error;

    /// Parses `projects/<project>/instances/<instance>/databases/<database>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            ["projects", project, "instances", instance, "databases", database]
                if !project.is_empty() && !instance.is_empty() && !database.is_empty() =>
            {
                Ok(DatabaseId::new(InstanceId::new(project, instance), database))
            }
            _ => Err(Error::Config(format!("invalid database name: {}", s))),
        }
    }
}

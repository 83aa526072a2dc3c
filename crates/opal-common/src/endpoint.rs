//! Endpoints and deployment topology
//!
//! An endpoint is one disk path, optionally on a remote host. The ordered
//! endpoint list is canonical: the index of an endpoint is its stripe
//! position for the lifetime of the deployment, so a permutation of disks
//! can never scramble an object.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// How the server composes its backends, decided from the endpoint list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupType {
    /// One local directory: plain filesystem backend.
    Fs,
    /// Several local directories: single-node erasure coding.
    Erasure,
    /// Endpoints spanning hosts: erasure coding plus distributed locking.
    DistErasure,
}

/// One disk or peer address
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host:port for remote endpoints, empty for local paths.
    pub host: String,
    /// Filesystem path of the disk on its host.
    pub path: PathBuf,
    pub is_local: bool,
}

impl Endpoint {
    /// Parse one CLI argument.
    ///
    /// Plain paths are local. `http://host:port/path` names a disk served
    /// by a peer; `localhost`/`127.0.0.1` hosts collapse to local.
    pub fn parse(arg: &str) -> Result<Self> {
        if let Some(rest) = arg.strip_prefix("http://").or_else(|| arg.strip_prefix("https://")) {
            let (host, path) = rest
                .split_once('/')
                .ok_or_else(|| Error::invalid_argument(format!("endpoint {arg} has no path")))?;
            if host.is_empty() || path.is_empty() {
                return Err(Error::invalid_argument(format!("invalid endpoint {arg}")));
            }
            let hostname = host.split(':').next().unwrap_or(host);
            let is_local = matches!(hostname, "localhost" | "127.0.0.1" | "::1");
            return Ok(Self {
                host: host.to_string(),
                path: PathBuf::from(format!("/{path}")),
                is_local,
            });
        }
        if arg.is_empty() {
            return Err(Error::invalid_argument("empty endpoint"));
        }
        Ok(Self {
            host: String::new(),
            path: PathBuf::from(arg),
            is_local: true,
        })
    }

    /// Stable identity used for logs and lock ownership records.
    #[must_use]
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.is_empty() {
            write!(f, "{}", self.path.display())
        } else {
            write!(f, "http://{}{}", self.host, self.path.display())
        }
    }
}

/// Ordered set of endpoints; index equals stripe position
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointList(Vec<Endpoint>);

impl EndpointList {
    /// Parse and validate the server's endpoint arguments.
    pub fn parse(args: &[String]) -> Result<Self> {
        if args.is_empty() {
            return Err(Error::invalid_argument("at least one endpoint is required"));
        }
        let endpoints = args
            .iter()
            .map(|a| Endpoint::parse(a))
            .collect::<Result<Vec<_>>>()?;

        let mut seen = std::collections::HashSet::new();
        for ep in &endpoints {
            if !seen.insert(ep.id()) {
                return Err(Error::invalid_argument(format!("duplicate endpoint {ep}")));
            }
        }

        let list = Self(endpoints);
        // Erasure deployments need an even drive count in 4..=32 so data
        // and parity can be split per storage class.
        if list.setup_type() != SetupType::Fs {
            let n = list.len();
            if !(4..=32).contains(&n) || n % 2 != 0 {
                return Err(Error::invalid_argument(format!(
                    "erasure mode requires an even number of drives between 4 and 32, got {n}"
                )));
            }
        }
        Ok(list)
    }

    #[must_use]
    pub fn setup_type(&self) -> SetupType {
        if self.0.len() == 1 {
            SetupType::Fs
        } else if self.0.iter().all(|e| e.is_local) {
            SetupType::Erasure
        } else {
            SetupType::DistErasure
        }
    }

    /// Distinct hosts participating in the deployment, in first-seen
    /// order. Local endpoints count as one unnamed host.
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        for ep in &self.0 {
            let host = if ep.is_local {
                String::new()
            } else {
                ep.host.clone()
            };
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.0.iter()
    }
}

impl std::ops::Index<usize> for EndpointList {
    type Output = Endpoint;

    fn index(&self, i: usize) -> &Endpoint {
        &self.0[i]
    }
}

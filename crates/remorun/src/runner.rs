//! # Runners
//!
//! A runner is a user object with named async methods that can live in another
//! execution context. A `RunnerDefinition` pairs a token (the name both sides
//! use to find it) with the list of callable methods and an async constructor.
//!
//! Method dispatch is by name. Runners take `&self`, so concurrent calls on one
//! instance are possible; keep mutable state behind a lock.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Failure;
use crate::error::Result;
use crate::value::RunnerValue;

/// Name a runner definition is registered and resolved under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnerToken(String);

impl RunnerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Defaults to the last path segment of the type name.
    pub fn of<R: ?Sized>() -> Self {
        Self(short_type_name::<R>().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunnerToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

fn short_type_name<R: ?Sized>() -> &'static str {
    let full = std::any::type_name::<R>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[async_trait::async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Invokes `method` with already-received arguments.
    async fn execute(&self, method: &str, args: Vec<RunnerValue>) -> anyhow::Result<RunnerValue>;

    /// Optional destructor, run once when the instance is destroyed.
    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type Constructor = Arc<dyn Fn(Vec<RunnerValue>) -> BoxFuture<'static, anyhow::Result<Arc<dyn Runner>>> + Send + Sync>;

#[derive(Clone)]
pub struct RunnerDefinition {
    token: RunnerToken,
    type_name: &'static str,
    methods: Arc<[String]>,
    constructor: Constructor,
}

impl RunnerDefinition {
    /// Defines runner type `R` with its callable `methods` and constructor.
    pub fn new<R, F, Fut>(methods: &[&str], constructor: F) -> Self
    where
        R: Runner,
        F: Fn(Vec<RunnerValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let constructor: Constructor = Arc::new(move |args| {
            constructor(args)
                .map(|built| built.map(|runner| Arc::new(runner) as Arc<dyn Runner>))
                .boxed()
        });

        Self {
            token: RunnerToken::of::<R>(),
            type_name: short_type_name::<R>(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            constructor,
        }
    }

    /// Overrides the default token.
    pub fn with_token(mut self, token: impl Into<RunnerToken>) -> Self {
        self.token = token.into();
        self
    }

    pub fn token(&self) -> &RunnerToken {
        &self.token
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn method_names(&self) -> &[String] {
        &self.methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    pub(crate) async fn construct(&self, args: Vec<RunnerValue>) -> anyhow::Result<Arc<dyn Runner>> {
        (self.constructor)(args).await
    }

    /// Wraps an existing instance so it can be passed by reference.
    pub fn local<R: Runner>(&self, runner: R) -> LocalRunner {
        LocalRunner {
            definition: self.clone(),
            runner: Arc::new(runner),
        }
    }
}

impl fmt::Debug for RunnerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerDefinition")
            .field("token", &self.token)
            .field("type_name", &self.type_name)
            .field("methods", &self.methods)
            .finish()
    }
}

/// A runner instance living in this context, to be exposed to a peer by
/// reference when passed as an argument or returned from a method.
#[derive(Clone)]
pub struct LocalRunner {
    definition: RunnerDefinition,
    runner: Arc<dyn Runner>,
}

impl LocalRunner {
    pub fn definition(&self) -> &RunnerDefinition {
        &self.definition
    }

    pub(crate) fn instance(&self) -> Arc<dyn Runner> {
        self.runner.clone()
    }
}

impl fmt::Debug for LocalRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRunner")
            .field("token", &self.definition.token)
            .finish()
    }
}

/// Token-indexed definitions known to one resolver.
#[derive(Default)]
pub struct RunnerCatalog {
    definitions: DashMap<RunnerToken, RunnerDefinition>,
}

impl RunnerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token maps to exactly one runner type.
    pub fn register(&self, definition: RunnerDefinition) -> Result<()> {
        if let Some(existing) = self.definitions.get(definition.token()) {
            if existing.type_name() != definition.type_name() {
                return Err(Error::Unexpected(Failure::new(format!(
                    "runner token \"{}\" is already registered for {}",
                    definition.token(),
                    existing.type_name()
                ))));
            }
        }
        self.definitions.insert(definition.token().clone(), definition);
        Ok(())
    }

    pub fn get(&self, token: &RunnerToken) -> Option<RunnerDefinition> {
        self.definitions.get(token).map(|d| d.value().clone())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

use async_trait::async_trait;
use pipecore::{step_fn, Record, StepContext, StepError, StepFunction};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Functions exported by one workflow's module, by name
pub type FunctionMap = HashMap<String, Arc<dyn StepFunction>>;

/// Maps `(workflow, function)` to the callable a step runs
#[async_trait]
pub trait FunctionResolver: Send + Sync {
    async fn resolve(&self, workflow: &str, function: &str)
        -> Result<Arc<dyn StepFunction>, StepError>;
}

/// Produces a workflow's function map on first use
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self) -> Result<FunctionMap, StepError>;
}

/// Metadata about a registered function
#[derive(Debug, Clone)]
pub struct FunctionMetadata {
    pub description: String,
    pub category: String,
}

impl Default for FunctionMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// A module assembled up front from known functions
#[derive(Clone, Default)]
pub struct FunctionModule {
    functions: FunctionMap,
    metadata: BTreeMap<String, FunctionMetadata>,
}

impl FunctionModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, function: impl StepFunction + 'static) -> Self {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn with_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Record, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        self.with(name, step_fn(f))
    }

    pub fn with_metadata(
        mut self,
        name: impl Into<String>,
        function: impl StepFunction + 'static,
        metadata: FunctionMetadata,
    ) -> Self {
        let name = name.into();
        self.metadata.insert(name.clone(), metadata);
        self.with(name, function)
    }

    /// Registered function names, sorted, with metadata where present
    pub fn list(&self) -> Vec<(String, Option<FunctionMetadata>)> {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| (name.clone(), self.metadata.get(name).cloned()))
            .collect()
    }
}

#[async_trait]
impl ModuleLoader for FunctionModule {
    async fn load(&self) -> Result<FunctionMap, StepError> {
        Ok(self.functions.clone())
    }
}

/// A module built by a closure, deferred until a step of its workflow runs
pub struct LazyModule<F>(F);

impl<F> LazyModule<F>
where
    F: Fn() -> Result<FunctionMap, StepError> + Send + Sync,
{
    pub fn new(build: F) -> Self {
        Self(build)
    }
}

#[async_trait]
impl<F> ModuleLoader for LazyModule<F>
where
    F: Fn() -> Result<FunctionMap, StepError> + Send + Sync,
{
    async fn load(&self) -> Result<FunctionMap, StepError> {
        (self.0)()
    }
}

/// Registry of workflow modules with a resolution cache.
///
/// Each workflow's loaders run at most once per registry and resolved
/// functions are memoized per `(workflow, function)` for the registry's
/// lifetime, across runs. Concurrent first resolutions of the same key
/// converge on whichever result was stored first.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Vec<Arc<dyn ModuleLoader>>>,
    loaded: RwLock<HashMap<String, Arc<FunctionMap>>>,
    cache: RwLock<HashMap<(String, String), Arc<dyn StepFunction>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a module to a workflow. Later bindings win on name clashes.
    pub fn bind(&mut self, workflow: impl Into<String>, loader: impl ModuleLoader + 'static) {
        self.bind_shared(workflow, Arc::new(loader));
    }

    pub fn bind_shared(&mut self, workflow: impl Into<String>, loader: Arc<dyn ModuleLoader>) {
        let workflow = workflow.into();
        tracing::info!("Binding module for workflow: {}", workflow);
        self.modules.entry(workflow).or_default().push(loader);
    }

    /// Workflows with at least one bound module
    pub fn workflows(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    async fn module(&self, workflow: &str) -> Result<Option<Arc<FunctionMap>>, StepError> {
        let cached = self.loaded.read().await.get(workflow).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let Some(loaders) = self.modules.get(workflow) else {
            return Ok(None);
        };

        tracing::debug!("Loading {} module(s) for workflow: {}", loaders.len(), workflow);
        let mut functions = FunctionMap::new();
        for loader in loaders {
            functions.extend(loader.load().await?);
        }

        let mut loaded = self.loaded.write().await;
        let module = loaded
            .entry(workflow.to_string())
            .or_insert_with(|| Arc::new(functions))
            .clone();
        Ok(Some(module))
    }
}

#[async_trait]
impl FunctionResolver for ModuleRegistry {
    async fn resolve(
        &self,
        workflow: &str,
        function: &str,
    ) -> Result<Arc<dyn StepFunction>, StepError> {
        let key = (workflow.to_string(), function.to_string());
        let cached = self.cache.read().await.get(&key).cloned();
        if let Some(found) = cached {
            return Ok(found);
        }

        let not_found = || StepError::ResolutionFailure {
            workflow: workflow.to_string(),
            function: function.to_string(),
        };
        let module = self.module(workflow).await?.ok_or_else(not_found)?;
        let found = module.get(function).cloned().ok_or_else(not_found)?;

        tracing::debug!("Resolved function {}.{}", workflow, function);
        let mut cache = self.cache.write().await;
        Ok(cache.entry(key).or_insert(found).clone())
    }
}

//! Runnables: units of computation with a uniform invoke/stream contract.
//!
//! A runnable that can be executed remotely must also be [`Serializable`] so
//! the worker can rebuild it from a [`RunnableDescriptor`] through a
//! [`GraphLoader`]. The built-in catalog ([`RunnableSpec`]) covers both sides.

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RunnableError, SerializationError};

/// Stream of incremental results.
pub type ValueStream<'a> = BoxStream<'a, Result<Value, RunnableError>>;

#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> String;

    async fn invoke(&self, input: Value) -> Result<Value, RunnableError>;

    /// Incremental results. Runnables without a natural chunking yield their
    /// whole output once.
    fn stream(&self, input: Value) -> ValueStream<'_> {
        stream::once(self.invoke(input)).boxed()
    }
}

/// Opaque serialized form of a runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnableDescriptor(String);

impl RunnableDescriptor {
    pub fn new(serialized: impl Into<String>) -> Self {
        Self(serialized.into())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SerializationError> {
        String::from_utf8(bytes)
            .map(Self)
            .map_err(|e| SerializationError::graph(format!("descriptor is not UTF-8: {e}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }
}

/// Capability of producing a portable description of a runnable.
pub trait Serializable: Send + Sync {
    fn name(&self) -> String;

    fn descriptor(&self) -> Result<RunnableDescriptor, SerializationError>;
}

/// Reconstructs runnables from descriptors inside the worker.
pub trait GraphLoader: Send + Sync {
    fn load(&self, descriptor: &RunnableDescriptor) -> Result<Box<dyn Runnable>, SerializationError>;
}

/// Declarative description of the built-in runnables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnableSpec {
    Passthrough,
    Pick { keys: Vec<String> },
    Constant { value: Value },
    Template { template: String },
    Chunks { size: usize },
    Sequence { steps: Vec<RunnableSpec> },
}

impl RunnableSpec {
    pub fn build(&self) -> Box<dyn Runnable> {
        match self {
            Self::Passthrough => Box::new(Passthrough),
            Self::Pick { keys } => Box::new(Pick::new(keys.clone())),
            Self::Constant { value } => Box::new(Constant::new(value.clone())),
            Self::Template { template } => Box::new(Template::new(template.clone())),
            Self::Chunks { size } => Box::new(Chunks::new(*size)),
            Self::Sequence { steps } => Box::new(Sequence::new(
                steps.iter().map(RunnableSpec::build).collect(),
            )),
        }
    }
}

impl Serializable for RunnableSpec {
    fn name(&self) -> String {
        match self {
            Self::Passthrough => "passthrough".to_string(),
            Self::Pick { .. } => "pick".to_string(),
            Self::Constant { .. } => "constant".to_string(),
            Self::Template { .. } => "template".to_string(),
            Self::Chunks { .. } => "chunks".to_string(),
            Self::Sequence { steps } => {
                let names: Vec<String> = steps.iter().map(Serializable::name).collect();
                format!("sequence({})", names.join(" | "))
            }
        }
    }

    fn descriptor(&self) -> Result<RunnableDescriptor, SerializationError> {
        let text = serde_json::to_string(self).map_err(SerializationError::graph)?;
        Ok(RunnableDescriptor::new(text))
    }
}

/// Loader for [`RunnableSpec`] descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogLoader;

impl GraphLoader for CatalogLoader {
    fn load(&self, descriptor: &RunnableDescriptor) -> Result<Box<dyn Runnable>, SerializationError> {
        let spec: RunnableSpec =
            serde_json::from_str(descriptor.as_str()).map_err(SerializationError::graph)?;
        Ok(spec.build())
    }
}

/// Returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl Runnable for Passthrough {
    fn name(&self) -> String {
        "passthrough".to_string()
    }

    async fn invoke(&self, input: Value) -> Result<Value, RunnableError> {
        Ok(input)
    }
}

/// Keeps only the listed keys of an object input.
#[derive(Debug, Clone)]
pub struct Pick {
    keys: Vec<String>,
}

impl Pick {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Runnable for Pick {
    fn name(&self) -> String {
        "pick".to_string()
    }

    async fn invoke(&self, input: Value) -> Result<Value, RunnableError> {
        let Value::Object(mut map) = input else {
            return Err(RunnableError::invalid_input("pick expects an object input"));
        };
        let picked = self
            .keys
            .iter()
            .filter_map(|key| map.remove(key).map(|v| (key.clone(), v)))
            .collect();
        Ok(Value::Object(picked))
    }
}

/// Ignores its input and returns a fixed value.
#[derive(Debug, Clone)]
pub struct Constant {
    value: Value,
}

impl Constant {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

#[async_trait]
impl Runnable for Constant {
    fn name(&self) -> String {
        "constant".to_string()
    }

    async fn invoke(&self, _input: Value) -> Result<Value, RunnableError> {
        Ok(self.value.clone())
    }
}

/// Renders `{name}` placeholders from the input.
///
/// Object inputs supply placeholders by key; any other input is available as
/// `{input}`. `{{` and `}}` are literal braces.
#[derive(Debug, Clone)]
pub struct Template {
    template: String,
}

impl Template {
    pub fn new(template: String) -> Self {
        Self { template }
    }

    pub fn render(&self, input: &Value) -> Result<String, RunnableError> {
        let mut out = String::with_capacity(self.template.len());
        let mut chars = self.template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => {
                                return Err(RunnableError::invalid_input(format!(
                                    "unclosed placeholder in template: {{{name}"
                                )));
                            }
                        }
                    }
                    out.push_str(&lookup(input, name.trim())?);
                }
                _ => out.push(c),
            }
        }
        Ok(out)
    }
}

fn lookup(input: &Value, name: &str) -> Result<String, RunnableError> {
    let value = match input {
        Value::Object(map) => map.get(name),
        other if name == "input" => Some(other),
        _ => None,
    }
    .ok_or_else(|| RunnableError::invalid_input(format!("missing template variable '{name}'")))?;
    Ok(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[async_trait]
impl Runnable for Template {
    fn name(&self) -> String {
        "template".to_string()
    }

    async fn invoke(&self, input: Value) -> Result<Value, RunnableError> {
        self.render(&input).map(Value::String)
    }
}

/// Streams a string input in chunks of `size` characters.
#[derive(Debug, Clone, Copy)]
pub struct Chunks {
    size: usize,
}

impl Chunks {
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    fn split(&self, input: &Value) -> Result<Vec<String>, RunnableError> {
        if self.size == 0 {
            return Err(RunnableError::invalid_input("chunk size must be positive"));
        }
        let Value::String(text) = input else {
            return Err(RunnableError::invalid_input("chunks expects a string input"));
        };
        let chars: Vec<char> = text.chars().collect();
        Ok(chars
            .chunks(self.size)
            .map(|chunk| chunk.iter().collect())
            .collect())
    }
}

#[async_trait]
impl Runnable for Chunks {
    fn name(&self) -> String {
        "chunks".to_string()
    }

    async fn invoke(&self, input: Value) -> Result<Value, RunnableError> {
        Ok(Value::String(self.split(&input)?.concat()))
    }

    fn stream(&self, input: Value) -> ValueStream<'_> {
        match self.split(&input) {
            Ok(parts) => stream::iter(parts.into_iter().map(|p| Ok(Value::String(p)))).boxed(),
            Err(e) => stream::once(future::ready(Err(e))).boxed(),
        }
    }
}

/// Feeds each step's output into the next.
///
/// Streaming invokes every step but the last, then streams the last one.
pub struct Sequence {
    steps: Vec<Box<dyn Runnable>>,
}

impl Sequence {
    pub fn new(steps: Vec<Box<dyn Runnable>>) -> Self {
        Self { steps }
    }

    pub fn pipe(mut self, step: impl Runnable + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl Runnable for Sequence {
    fn name(&self) -> String {
        let names: Vec<String> = self.steps.iter().map(|s| s.name()).collect();
        format!("sequence({})", names.join(" | "))
    }

    async fn invoke(&self, input: Value) -> Result<Value, RunnableError> {
        let mut value = input;
        for step in &self.steps {
            value = step.invoke(value).await?;
        }
        Ok(value)
    }

    fn stream(&self, input: Value) -> ValueStream<'_> {
        let Some((last, head)) = self.steps.split_last() else {
            return stream::once(future::ready(Ok(input))).boxed();
        };
        let prefix = async move {
            let mut value = input;
            for step in head {
                value = step.invoke(value).await?;
            }
            Ok::<_, RunnableError>(value)
        };
        stream::once(prefix)
            .map(move |result| match result {
                Ok(value) => last.stream(value),
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            })
            .flatten()
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn passthrough_returns_input() {
        let out = Passthrough.invoke(json!({"input": "Pikachu"})).await.unwrap();
        assert_eq!(out, json!({"input": "Pikachu"}));
    }

    #[tokio::test]
    async fn default_stream_yields_invoke_result_once() {
        let items: Vec<Value> = Passthrough.stream(json!(42)).try_collect().await.unwrap();
        assert_eq!(items, vec![json!(42)]);
    }

    #[tokio::test]
    async fn pick_keeps_present_keys() {
        let pick = Pick::new(vec!["a".to_string(), "missing".to_string()]);
        let out = pick.invoke(json!({"a": 1, "b": 2})).await.unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[tokio::test]
    async fn pick_rejects_non_object() {
        let err = Pick::new(vec!["a".to_string()])
            .invoke(json!("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnableError::InvalidInput(_)));
    }

    #[test]
    fn template_renders_object_keys_and_escapes() {
        let template = Template::new("Hello {name}, {{literal}} {count}".to_string());
        let out = template.render(&json!({"name": "Ash", "count": 3})).unwrap();
        assert_eq!(out, "Hello Ash, {literal} 3");
    }

    #[test]
    fn template_scalar_input_binds_input() {
        let template = Template::new("I choose {input}!".to_string());
        assert_eq!(template.render(&json!("Pikachu")).unwrap(), "I choose Pikachu!");
    }

    #[test]
    fn template_missing_variable() {
        let template = Template::new("{nope}".to_string());
        let err = template.render(&json!({})).unwrap_err();
        assert!(err.to_string().contains("missing template variable 'nope'"));
    }

    #[test]
    fn template_unclosed_placeholder() {
        let template = Template::new("oops {name".to_string());
        assert!(template.render(&json!({"name": "x"})).is_err());
    }

    #[tokio::test]
    async fn chunks_streams_characters() {
        let items: Vec<Value> = Chunks::new(2)
            .stream(json!("héllo"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(items, vec![json!("hé"), json!("ll"), json!("o")]);
        assert_eq!(Chunks::new(2).invoke(json!("héllo")).await.unwrap(), json!("héllo"));
    }

    #[tokio::test]
    async fn chunks_rejects_zero_size() {
        let err = Chunks::new(0).invoke(json!("abc")).await.unwrap_err();
        assert!(matches!(err, RunnableError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn sequence_invokes_in_order() {
        let seq = Sequence::new(vec![Box::new(Pick::new(vec!["input".to_string()]))])
            .pipe(Template::new("{input}!".to_string()));
        let out = seq.invoke(json!({"input": "Pikachu", "other": 1})).await.unwrap();
        assert_eq!(out, json!("Pikachu!"));
        assert_eq!(seq.name(), "sequence(pick | template)");
    }

    #[tokio::test]
    async fn sequence_streams_last_step() {
        let seq = Sequence::new(vec![
            Box::new(Template::new("{input}?".to_string())),
            Box::new(Chunks::new(1)),
        ]);
        let items: Vec<Value> = seq.stream(json!("ab")).try_collect().await.unwrap();
        assert_eq!(items, vec![json!("a"), json!("b"), json!("?")]);
    }

    #[tokio::test]
    async fn sequence_stream_surfaces_prefix_error() {
        let seq = Sequence::new(vec![
            Box::new(Pick::new(vec![])),
            Box::new(Chunks::new(1)),
        ]);
        let items: Vec<Result<Value, RunnableError>> = seq.stream(json!("not an object")).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[tokio::test]
    async fn empty_sequence_is_identity() {
        let seq = Sequence::new(Vec::new());
        assert!(seq.is_empty());
        assert_eq!(seq.invoke(json!([1, 2])).await.unwrap(), json!([1, 2]));
    }

    #[test]
    fn spec_descriptor_format() {
        let spec = RunnableSpec::Sequence {
            steps: vec![
                RunnableSpec::Pick {
                    keys: vec!["input".to_string()],
                },
                RunnableSpec::Chunks { size: 4 },
            ],
        };
        insta::assert_snapshot!(
            spec.descriptor().unwrap().as_str(),
            @r#"{"type":"sequence","steps":[{"type":"pick","keys":["input"]},{"type":"chunks","size":4}]}"#
        );
        assert_eq!(Serializable::name(&spec), "sequence(pick | chunks)");
    }

    #[tokio::test]
    async fn catalog_loader_rebuilds_descriptor() {
        let spec = RunnableSpec::Template {
            template: "{input} used thunderbolt".to_string(),
        };
        let runnable = CatalogLoader.load(&spec.descriptor().unwrap()).unwrap();
        let out = runnable.invoke(json!("Pikachu")).await.unwrap();
        assert_eq!(out, json!("Pikachu used thunderbolt"));
    }

    #[test]
    fn catalog_loader_rejects_unknown_type() {
        let err = CatalogLoader
            .load(&RunnableDescriptor::new(r#"{"type":"teleport"}"#))
            .err()
            .unwrap();
        assert!(matches!(err, SerializationError::Graph(_)));
    }

    #[test]
    fn descriptor_from_invalid_utf8() {
        assert!(RunnableDescriptor::from_bytes(vec![0xff, 0xfe]).is_err());
    }
}

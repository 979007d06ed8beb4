//! Structural identity of a decoded artifact.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifies where the undecoded bytes of a resource come from.
///
/// This is typically a URI such as `file:///photos/cat.png` or `https://cdn.example/cat.png`,
/// but the engine treats it as opaque; it is only interpreted by the registered
/// [`DataFetcherFactory`](crate::pipeline::DataFetcherFactory)s.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(Arc<str>);

impl SourceId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the scheme part of the source, if it looks like a URI.
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Whether the source is read from the local machine.
    ///
    /// Local sources are cheap to re-read, which influences the
    /// [`DiskCacheStrategy::Automatic`](crate::caching::DiskCacheStrategy::Automatic) decision.
    pub fn is_local(&self) -> bool {
        matches!(self.scheme(), None | Some("file") | Some("memory"))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The identifier of a registered [`Transformation`](crate::pipeline::Transformation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransformationId(Arc<str>);

impl TransformationId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransformationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransformationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The kind of decoded artifact a request asks for, used to pick a decoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceClass(Cow<'static, str>);

impl ResourceClass {
    pub const IMAGE: ResourceClass = ResourceClass(Cow::Borrowed("image"));
    pub const BYTES: ResourceClass = ResourceClass(Cow::Borrowed("bytes"));

    pub fn new(class: impl Into<Cow<'static, str>>) -> Self {
        Self(class.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ResourceClass {
    fn default() -> Self {
        Self::IMAGE
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The target dimensions of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// Requests the resource in its original, unscaled size.
    pub const ORIGINAL: Dimensions = Dimensions {
        width: u32::MAX,
        height: u32::MAX,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_original(&self) -> bool {
        *self == Self::ORIGINAL
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::ORIGINAL
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_original() {
            f.write_str("original")
        } else {
            write!(f, "{}x{}", self.width, self.height)
        }
    }
}

/// How a decoder should scale the source to fit the requested [`Dimensions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeStrategy {
    /// Keep the source dimensions.
    None,
    /// Scale so that both dimensions are at least the requested ones.
    AtLeast,
    /// Scale so that both dimensions are at most the requested ones.
    AtMost,
    /// Scale so that the source fits into the requested box, upscaling if needed.
    FitCenter,
    /// Like [`FitCenter`](Self::FitCenter), but never upscales.
    CenterInside,
    /// Scale so that the source covers the requested box.
    #[default]
    CenterOutside,
}

impl ResizeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AtLeast => "at_least",
            Self::AtMost => "at_most",
            Self::FitCenter => "fit_center",
            Self::CenterInside => "center_inside",
            Self::CenterOutside => "center_outside",
        }
    }
}

/// The identity of one exact decoded artifact.
///
/// Two keys with identical fields are interchangeable: they hash and compare equal, and a
/// resource decoded for one of them is a valid cache hit for the other. The order of
/// transformations is significant.
///
/// All fields are reference counted, so cloning a key is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    source: SourceId,
    size: Dimensions,
    resize: ResizeStrategy,
    transformations: Arc<[TransformationId]>,
    resource_class: ResourceClass,
    signature: Option<Arc<str>>,
}

impl ResourceKey {
    /// Creates a key for the untransformed, original-size resource at `source`.
    pub fn new(source: impl Into<SourceId>) -> Self {
        Self::builder(source).build()
    }

    pub fn builder(source: impl Into<SourceId>) -> ResourceKeyBuilder {
        ResourceKeyBuilder {
            source: source.into(),
            size: Dimensions::ORIGINAL,
            resize: ResizeStrategy::default(),
            transformations: Vec::new(),
            resource_class: ResourceClass::default(),
            signature: None,
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn size(&self) -> Dimensions {
        self.size
    }

    pub fn resize(&self) -> ResizeStrategy {
        self.resize
    }

    pub fn transformations(&self) -> &[TransformationId] {
        &self.transformations
    }

    pub fn resource_class(&self) -> &ResourceClass {
        &self.resource_class
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source, self.size)?;
        if !self.transformations.is_empty() {
            f.write_str("[")?;
            for (i, t) in self.transformations.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                f.write_str(t.as_str())?;
            }
            f.write_str("]")?;
        }
        if let Some(signature) = &self.signature {
            write!(f, "#{signature}")?;
        }
        Ok(())
    }
}

/// A builder for [`ResourceKey`]s.
#[derive(Debug, Clone)]
pub struct ResourceKeyBuilder {
    source: SourceId,
    size: Dimensions,
    resize: ResizeStrategy,
    transformations: Vec<TransformationId>,
    resource_class: ResourceClass,
    signature: Option<Arc<str>>,
}

impl ResourceKeyBuilder {
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.size = Dimensions::new(width, height);
        self
    }

    pub fn resize(mut self, resize: ResizeStrategy) -> Self {
        self.resize = resize;
        self
    }

    /// Appends a transformation to the chain. Transformations apply in insertion order.
    pub fn transform(mut self, id: impl Into<TransformationId>) -> Self {
        self.transformations.push(id.into());
        self
    }

    pub fn resource_class(mut self, class: ResourceClass) -> Self {
        self.resource_class = class;
        self
    }

    /// Sets a cache-busting signature, for example a file modification time or a version.
    pub fn signature(mut self, signature: impl Into<Arc<str>>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn build(self) -> ResourceKey {
        ResourceKey {
            source: self.source,
            size: self.size,
            resize: self.resize,
            transformations: self.transformations.into(),
            resource_class: self.resource_class,
            signature: self.signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use super::*;

    fn hash_of(key: &ResourceKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_structural_equality() {
        let a = ResourceKey::builder("https://cdn.example/cat.png")
            .size(100, 200)
            .transform("grayscale")
            .transform("rounded")
            .build();
        let b = ResourceKey::builder("https://cdn.example/cat.png")
            .size(100, 200)
            .transform("grayscale")
            .transform("rounded")
            .build();

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_transformation_order_matters() {
        let a = ResourceKey::builder("file:///cat.png")
            .transform("grayscale")
            .transform("rounded")
            .build();
        let b = ResourceKey::builder("file:///cat.png")
            .transform("rounded")
            .transform("grayscale")
            .build();

        assert_ne!(a, b);
    }

    #[test]
    fn test_every_field_participates() {
        let base = ResourceKey::builder("file:///cat.png").size(10, 10);
        let key = base.clone().build();

        assert_ne!(key, base.clone().size(10, 11).build());
        assert_ne!(key, base.clone().resize(ResizeStrategy::FitCenter).build());
        assert_ne!(
            key,
            base.clone().resource_class(ResourceClass::BYTES).build()
        );
        assert_ne!(key, base.clone().signature("v2").build());
        assert_eq!(key, base.build());
    }

    #[test]
    fn test_display() {
        let key = ResourceKey::builder("file:///cat.png")
            .size(64, 32)
            .transform("blur")
            .transform("crop")
            .signature("v1")
            .build();
        assert_eq!(key.to_string(), "file:///cat.png@64x32[blur,crop]#v1");
        assert_eq!(
            ResourceKey::new("memory://a").to_string(),
            "memory://a@original"
        );
    }

    #[test]
    fn test_local_sources() {
        assert!(SourceId::new("file:///a.png").is_local());
        assert!(SourceId::new("/tmp/a.png").is_local());
        assert!(!SourceId::new("https://cdn.example/a.png").is_local());
    }
}

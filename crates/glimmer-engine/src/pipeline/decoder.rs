use bytes::Bytes;

use crate::error::DecodeError;
use crate::key::{ResizeStrategy, ResourceClass, TransformationId};

/// Per-request hints passed to a [`ResourceDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOptions {
    pub resource_class: ResourceClass,
    pub resize: ResizeStrategy,
    /// The bytes are an encoded resource from the resource disk tier.
    ///
    /// They already have every transformation and the target size applied, and should be
    /// decoded as-is.
    pub transformed: bool,
}

/// Turns fetched bytes into a resource.
pub trait ResourceDecoder<T>: Send + Sync {
    fn handles(&self, resource_class: &ResourceClass) -> bool;

    /// Decodes `data` for a target of `width` by `height`.
    ///
    /// Returns `Ok(None)` if this decoder does not understand the data, in which case the next
    /// registered decoder is tried.
    fn decode(
        &self,
        data: &Bytes,
        width: u32,
        height: u32,
        options: &DecodeOptions,
    ) -> Result<Option<T>, DecodeError>;
}

/// Turns a resource back into bytes for the resource disk tier.
pub trait ResourceEncoder<T>: Send + Sync {
    fn encode(&self, resource: &T) -> Result<Bytes, DecodeError>;
}

/// A pure transformation of a decoded resource.
///
/// Transformations are applied in the order they appear in the
/// [`ResourceKey`](crate::ResourceKey), and are looked up by their [`id`](Self::id).
pub trait Transformation<T>: Send + Sync {
    fn id(&self) -> &TransformationId;

    fn transform(&self, resource: T, width: u32, height: u32) -> Result<T, DecodeError>;
}

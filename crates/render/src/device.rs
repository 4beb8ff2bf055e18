//! Device abstraction driven by the texture streamer and context pool
//!
//! Backends (wgpu, Metal, GL) implement these traits; this crate never
//! talks to a graphics API directly.

use crate::error::RenderResult;
use crate::format::TextureDescriptor;

/// Texture operations on one rendering context.
pub trait GpuDevice {
    /// Backend texture handle
    type Texture;

    /// Allocate a 3-D texture. Contents are undefined until uploaded.
    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> RenderResult<Self::Texture>;

    fn bind(&mut self, texture: &Self::Texture) -> RenderResult<()>;

    /// Write `data` into the box at `offset` with size `extent`, both in
    /// texels as `[x, y, z]`. `data` is tightly packed.
    fn upload_sub_region(
        &mut self,
        texture: &Self::Texture,
        offset: [u32; 3],
        extent: [u32; 3],
        data: &[u8],
    ) -> RenderResult<()>;

    fn generate_mipmap(&mut self, texture: &Self::Texture) -> RenderResult<()>;

    fn release_texture(&mut self, texture: Self::Texture);
}

/// Creates and tears down the fixed set of contexts held by a
/// [`crate::ContextPool`].
pub trait ContextFactory {
    type Context;

    fn create_context(&mut self, index: usize) -> RenderResult<Self::Context>;

    fn destroy_context(&mut self, index: usize, context: Self::Context);
}

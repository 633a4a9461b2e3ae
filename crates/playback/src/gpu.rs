//! GPU upload path: double-buffered staging between the CPU-side decoded
//! frame and the texture the renderers sample.
//!
//! The buffer written on a given tick is the one the GPU finished consuming
//! on a prior tick, so the copy into the texture never waits on the write
//! that produced this tick's frame. When staging cannot be allocated the
//! path degrades to a direct synchronous upload.

use tracing::warn;

use crate::ring::FrameImage;

/// Borrowed device/queue pair the render thread passes into `update()`.
pub struct GpuContext<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
}

impl<'a> GpuContext<'a> {
    pub fn new(device: &'a wgpu::Device, queue: &'a wgpu::Queue) -> Self {
        Self { device, queue }
    }
}

/// Token for the staging buffer a caller is allowed to write this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageHandle(usize);

impl StageHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index arithmetic of the two-buffer staging pair, kept separate from the
/// GPU resources so its invariants are checkable without a device.
#[derive(Debug, Clone, Copy)]
pub struct DualStaging {
    current: usize,
    next: usize,
}

impl Default for DualStaging {
    fn default() -> Self {
        Self {
            current: 0,
            next: 1,
        }
    }
}

impl DualStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffer to fill with this tick's frame.
    pub fn write(&self) -> StageHandle {
        StageHandle(self.next)
    }

    /// Hand the previously filled buffer to the GPU and flip the pair.
    /// Returns the index to upload from.
    pub fn consume(&mut self, written: StageHandle) -> usize {
        let upload = self.current;
        self.current = written.0;
        self.next = 1 - written.0;
        upload
    }

    /// Buffer holding the newest complete frame (upload source for a
    /// same-content double upload).
    pub fn current(&self) -> usize {
        self.current
    }
}

#[inline]
fn align_up(x: u32, align: u32) -> u32 {
    (x + align - 1) & !(align - 1)
}

const ROW_ALIGN: u32 = 256;
const BYTES_PER_PIXEL: u32 = 4;

struct StagingPair {
    buffers: [wgpu::Buffer; 2],
    indices: DualStaging,
    padded_bytes_per_row: u32,
}

/// Texture plus optional staging pair for one player.
pub struct VideoTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    use_staging: bool,
    staging: Option<StagingPair>,
    staging_failed: bool,
    scratch: Vec<u8>,
}

impl VideoTexture {
    /// Allocate a texture at the probed resolution. `use_staging` is off for
    /// still images, which upload exactly once.
    pub fn new(device: &wgpu::Device, width: u32, height: u32, use_staging: bool) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("player frame"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
            use_staging,
            staging: None,
            staging_failed: false,
            scratch: Vec::new(),
        }
    }

    /// Black texture shown before the first frame and after failure.
    pub fn placeholder(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let tex = Self::new(device, 2, 2, false);
        let black = [0u8; 2 * 2 * 4];
        queue.write_texture(
            tex.copy_target(),
            &black,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(2 * BYTES_PER_PIXEL),
                rows_per_image: Some(2),
            },
            tex.extent(),
        );
        tex
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }

    fn copy_target(&self) -> wgpu::ImageCopyTexture<'_> {
        wgpu::ImageCopyTexture {
            texture: &self.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        }
    }

    fn ensure_staging(&mut self, device: &wgpu::Device) {
        if self.staging.is_some() || self.staging_failed || !self.use_staging {
            return;
        }
        let padded = align_up(self.width * BYTES_PER_PIXEL, ROW_ALIGN);
        let size = u64::from(padded) * u64::from(self.height);
        if size > device.limits().max_buffer_size {
            warn!(size, "staging buffer exceeds device limits, using direct uploads");
            self.staging_failed = true;
            return;
        }
        let make = |label: &str| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        self.staging = Some(StagingPair {
            buffers: [make("frame staging 0"), make("frame staging 1")],
            indices: DualStaging::new(),
            padded_bytes_per_row: padded,
        });
    }

    /// Repack the tight RGBA rows into the 256-byte-aligned layout buffer
    /// copies require.
    fn pack_padded(&mut self, image: &FrameImage, padded: u32) {
        let tight = (self.width * BYTES_PER_PIXEL) as usize;
        let padded = padded as usize;
        self.scratch.clear();
        self.scratch.resize(padded * self.height as usize, 0);
        for row in 0..self.height as usize {
            let src = row * tight;
            let dst = row * padded;
            self.scratch[dst..dst + tight].copy_from_slice(&image.data[src..src + tight]);
        }
    }

    /// Upload one frame. `double` uploads the same frame through both
    /// staging buffers in one tick, so the first appearance after a preroll
    /// or seek is never one tick late.
    pub fn upload(&mut self, gpu: &GpuContext<'_>, image: &FrameImage, double: bool) {
        if image.width != self.width || image.height != self.height {
            warn!(
                got_w = image.width,
                got_h = image.height,
                want_w = self.width,
                want_h = self.height,
                "frame size does not match texture, dropping"
            );
            return;
        }
        self.ensure_staging(gpu.device);
        let Some(ref mut pair) = self.staging else {
            self.upload_direct(gpu.queue, image);
            return;
        };

        let padded = pair.padded_bytes_per_row;
        let upload_from = if double {
            // Fill both buffers with the same frame; either is current.
            pair.indices.current()
        } else {
            let handle = pair.indices.write();
            pair.indices.consume(handle)
        };

        let pair = self.staging.take().expect("staging just checked");
        self.pack_padded(image, padded);
        if double {
            for buffer in &pair.buffers {
                gpu.queue.write_buffer(buffer, 0, &self.scratch);
            }
        } else {
            let write_to = 1 - upload_from;
            gpu.queue.write_buffer(&pair.buffers[write_to], 0, &self.scratch);
        }

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame upload"),
            });
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &pair.buffers[upload_from],
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(self.height),
                },
            },
            self.copy_target(),
            self.extent(),
        );
        gpu.queue.submit(Some(encoder.finish()));
        self.staging = Some(pair);
    }

    /// Direct synchronous upload; correct but not latency-optimal.
    pub fn upload_direct(&self, queue: &wgpu::Queue, image: &FrameImage) {
        queue.write_texture(
            self.copy_target(),
            &image.data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(self.width * BYTES_PER_PIXEL),
                rows_per_image: Some(self.height),
            },
            self.extent(),
        );
    }
}

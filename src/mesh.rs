// Mesh and texture inputs
//
// CPU-side data handed to the upload engine: deduplicated vertex/index lists
// and tightly packed RGBA8 pixels. Files are parsed by tobj and image; the
// built-in quad and checkerboard stand in when no asset is configured.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::collections::HashMap;
use std::mem::offset_of;
use std::path::Path;

use crate::backend::mipmap::mip_levels;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec3,
    pub color: Vec3,
    pub tex_coord: Vec2,
}

impl Vertex {
    pub const fn new(pos: Vec3, color: Vec3, tex_coord: Vec2) -> Self {
        Self {
            pos,
            color,
            tex_coord,
        }
    }

    /// Bit pattern of every component; equal keys mean identical vertices
    fn key(&self) -> [u32; 8] {
        [
            self.pos.x.to_bits(),
            self.pos.y.to_bits(),
            self.pos.z.to_bits(),
            self.color.x.to_bits(),
            self.color.y.to_bits(),
            self.color.z.to_bits(),
            self.tex_coord.x.to_bits(),
            self.tex_coord.y.to_bits(),
        ]
    }

    pub fn binding_descriptions() -> [vk::VertexInputBindingDescription; 1] {
        [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)]
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, pos) as u32),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, color) as u32),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(2)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex, tex_coord) as u32),
        ]
    }
}

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Index a triangle list, merging vertices that are bit-for-bit identical
    pub fn from_vertices(vertices: impl IntoIterator<Item = Vertex>) -> Self {
        let mut mesh = Self::default();
        let mut unique: HashMap<[u32; 8], u32> = HashMap::new();

        for vertex in vertices {
            let index = *unique.entry(vertex.key()).or_insert_with(|| {
                mesh.vertices.push(vertex);
                (mesh.vertices.len() - 1) as u32
            });
            mesh.indices.push(index);
        }

        mesh
    }

    /// Textured square facing +Z, used when no model is configured
    pub fn quad() -> Self {
        let white = Vec3::ONE;
        let corners = [
            Vertex::new(Vec3::new(-0.5, -0.5, 0.0), white, Vec2::new(1.0, 0.0)),
            Vertex::new(Vec3::new(0.5, -0.5, 0.0), white, Vec2::new(0.0, 0.0)),
            Vertex::new(Vec3::new(0.5, 0.5, 0.0), white, Vec2::new(0.0, 1.0)),
            Vertex::new(Vec3::new(-0.5, 0.5, 0.0), white, Vec2::new(1.0, 1.0)),
        ];

        Self::from_vertices([0, 1, 2, 2, 3, 0].map(|i| corners[i]))
    }

    /// Load every model of an OBJ file as one triangulated mesh
    pub fn load_obj(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (models, _materials) = tobj::load_obj(
            path,
            &tobj::LoadOptions {
                triangulate: true,
                single_index: true,
                ..Default::default()
            },
        )
        .with_context(|| format!("Failed to load model {}", path.display()))?;

        let vertices = models.iter().flat_map(|model| {
            let mesh = &model.mesh;
            mesh.indices.iter().map(move |&index| {
                let i = index as usize;
                let pos = Vec3::new(
                    mesh.positions[3 * i],
                    mesh.positions[3 * i + 1],
                    mesh.positions[3 * i + 2],
                );
                // OBJ puts v = 0 at the bottom, Vulkan samples from the top
                let tex_coord = if mesh.texcoords.len() >= 2 * i + 2 {
                    Vec2::new(mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1])
                } else {
                    Vec2::ZERO
                };
                Vertex::new(pos, Vec3::ONE, tex_coord)
            })
        });

        let mesh = Self::from_vertices(vertices);
        if mesh.indices.is_empty() {
            anyhow::bail!("Model {} contains no triangles", path.display());
        }

        log::info!(
            "Loaded {}: {} vertices, {} indices",
            path.display(),
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(mesh)
    }
}

/// Decoded RGBA8 texture
#[derive(Clone, Debug)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let rgba = image::open(path)
            .with_context(|| format!("Failed to open texture {}", path.display()))?
            .into_rgba8();

        let (width, height) = rgba.dimensions();
        log::info!("Loaded texture {}: {}x{}", path.display(), width, height);

        Ok(Self {
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }

    /// Square black-and-white checkerboard of 8x8 cells
    pub fn checkerboard(size: u32) -> Self {
        let cell = (size / 8).max(1);
        let pixels = (0..size)
            .flat_map(|y| (0..size).map(move |x| (x / cell + y / cell) % 2 == 0))
            .flat_map(|light| if light { [0xff; 4] } else { [0x20, 0x20, 0x20, 0xff] })
            .collect();

        Self {
            width: size,
            height: size,
            pixels,
        }
    }

    pub fn mip_levels(&self) -> u32 {
        mip_levels(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_has_four_unique_vertices() {
        let quad = Mesh::quad();
        assert_eq!(quad.vertices.len(), 4);
        assert_eq!(quad.indices, vec![0, 1, 2, 2, 3, 0]);
    }

    #[test]
    fn dedup_is_bit_exact() {
        let a = Vertex::new(Vec3::ZERO, Vec3::ONE, Vec2::ZERO);
        // -0.0 == 0.0 numerically but has a different bit pattern
        let b = Vertex::new(Vec3::new(-0.0, 0.0, 0.0), Vec3::ONE, Vec2::ZERO);
        let mesh = Mesh::from_vertices([a, b, a]);

        assert_eq!(mesh.vertices.len(), 2);
        assert_eq!(mesh.indices, vec![0, 1, 0]);
    }

    #[test]
    fn indices_reference_equal_vertices() {
        let raw: Vec<Vertex> = (0..30)
            .map(|i| {
                let v = (i % 7) as f32;
                Vertex::new(Vec3::new(v, v * 2.0, 0.0), Vec3::ONE, Vec2::new(v, 0.5))
            })
            .collect();
        let mesh = Mesh::from_vertices(raw.iter().copied());

        assert_eq!(mesh.vertices.len(), 7);
        assert_eq!(mesh.indices.len(), raw.len());
        for (original, &index) in raw.iter().zip(&mesh.indices) {
            assert_eq!(&mesh.vertices[index as usize], original);
        }
    }

    #[test]
    fn vertex_layout_matches_struct() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
        assert_eq!(Vertex::binding_descriptions()[0].stride, 32);
    }

    #[test]
    fn checkerboard_is_rgba8_with_full_chain() {
        let texture = TextureData::checkerboard(256);
        assert_eq!(texture.pixels.len(), 256 * 256 * 4);
        assert_eq!(texture.mip_levels(), 9);

        // First cell light, next cell dark
        assert_eq!(&texture.pixels[..4], &[0xff; 4]);
        assert_eq!(&texture.pixels[32 * 4..32 * 4 + 4], &[0x20, 0x20, 0x20, 0xff]);
    }

    #[test]
    fn missing_assets_report_their_path() {
        let err = Mesh::load_obj("does/not/exist.obj").unwrap_err();
        assert!(format!("{:#}", err).contains("does/not/exist.obj"));

        let err = TextureData::load("does/not/exist.png").unwrap_err();
        assert!(format!("{:#}", err).contains("does/not/exist.png"));
    }
}

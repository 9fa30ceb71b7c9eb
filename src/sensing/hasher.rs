use image::GenericImageView;
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHashes {
    /// Coarse perceptual digest, base64. Survives cursor moves and blinking carets.
    pub stable: String,
    /// SHA-256 of the encoded bytes, hex. Equal only for byte-identical frames.
    pub detail: String,
    pub width: u32,
    pub height: u32,
}

/// Hashes one encoded frame. Pure and deterministic for identical bytes.
pub fn hash_frame(bytes: &[u8]) -> PipelineResult<FrameHashes> {
    if bytes.is_empty() {
        return Err(PipelineError::validation("empty frame"));
    }

    let img = image::load_from_memory(bytes)
        .map_err(|err| PipelineError::validation(format!("undecodable frame: {err}")))?;
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::validation("frame has zero size"));
    }

    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();
    let stable = hasher.hash_image(&img).to_base64();

    Ok(FrameHashes {
        stable,
        detail: compute_detail_hash(bytes),
        width,
        height,
    })
}

pub fn compute_detail_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn compute_hamming_distance(lhs: &str, rhs: &str) -> u32 {
    let Ok(h1) = ImageHash::<Vec<u8>>::from_base64(lhs) else {
        return u32::MAX;
    };
    let Ok(h2) = ImageHash::<Vec<u8>>::from_base64(rhs) else {
        return u32::MAX;
    };
    h1.dist(&h2)
}

// crates/reelkit-media/src/ppm.rs
//
// Binary netpbm codec: P6 (RGB) and P5 (grayscale), 8-bit only. Small
// enough to hand-roll, and the header-only probe lets sequence readers
// publish Info without decoding a frame.

use anyhow::{anyhow, bail, Result};

use crate::image::{Image, ImageInfo, PixelType};

/// Encode to P6 (RGB and RGBA, alpha dropped) or P5 (grayscale).
pub fn encode(image: &Image) -> Vec<u8> {
    let info = image.info();
    let (magic, channels) = match info.pixel {
        PixelType::L8 => ("P5", 1),
        PixelType::Rgb8 | PixelType::Rgba8 => ("P6", 3),
    };
    let header = format!("{}\n{} {}\n255\n", magic, info.width, info.height);
    let mut out = Vec::with_capacity(
        header.len() + info.width as usize * info.height as usize * channels,
    );
    out.extend_from_slice(header.as_bytes());
    match info.pixel {
        PixelType::L8 | PixelType::Rgb8 => out.extend_from_slice(image.data()),
        PixelType::Rgba8 => {
            for px in image.data().chunks_exact(4) {
                out.extend_from_slice(&px[..3]);
            }
        }
    }
    out
}

/// Header fields plus the offset where pixel data begins.
struct Header {
    info:   ImageInfo,
    offset: usize,
}

fn parse_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < 2 {
        bail!("truncated header");
    }
    let pixel = match &bytes[..2] {
        b"P6" => PixelType::Rgb8,
        b"P5" => PixelType::L8,
        magic => bail!("unsupported magic {:?}", String::from_utf8_lossy(magic)),
    };
    // Three whitespace-separated fields after the magic: width, height,
    // maxval. '#' starts a comment running to end of line.
    let mut fields = [0u32; 3];
    let mut field = 0;
    let mut pos = 2;
    while field < 3 {
        while pos < bytes.len() {
            match bytes[pos] {
                b'#' => {
                    while pos < bytes.len() && bytes[pos] != b'\n' {
                        pos += 1;
                    }
                }
                c if c.is_ascii_whitespace() => pos += 1,
                _ => break,
            }
        }
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == start {
            bail!("malformed header");
        }
        fields[field] = std::str::from_utf8(&bytes[start..pos])?
            .parse()
            .map_err(|e| anyhow!("bad header field: {e}"))?;
        field += 1;
    }
    // Exactly one whitespace byte separates the header from pixel data.
    if pos >= bytes.len() || !bytes[pos].is_ascii_whitespace() {
        bail!("missing header terminator");
    }
    pos += 1;
    let [width, height, maxval] = fields;
    if maxval != 255 {
        bail!("unsupported maxval {maxval}, only 8-bit supported");
    }
    if width == 0 || height == 0 {
        bail!("zero image dimension");
    }
    Ok(Header {
        info:   ImageInfo::new(width, height, pixel),
        offset: pos,
    })
}

/// Header-only probe.
pub fn probe(bytes: &[u8]) -> Result<ImageInfo> {
    Ok(parse_header(bytes)?.info)
}

pub fn decode(bytes: &[u8]) -> Result<Image> {
    let header = parse_header(bytes)?;
    let expected = header.info.byte_count();
    let data = bytes
        .get(header.offset..header.offset + expected)
        .ok_or_else(|| anyhow!("truncated pixel data"))?;
    Image::new(header.info, data.to_vec()).map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_round_trip() {
        let info = ImageInfo::new(4, 2, PixelType::Rgb8);
        let data: Vec<u8> = (0..info.byte_count() as u8).collect();
        let image = Image::new(info, data.clone()).unwrap();
        let bytes = encode(&image);
        let back = decode(&bytes).unwrap();
        assert_eq!(back.info(), info);
        assert_eq!(back.data(), &data[..]);
    }

    #[test]
    fn gray_round_trip() {
        let info = ImageInfo::new(3, 3, PixelType::L8);
        let image = Image::solid(info, 77);
        let back = decode(&encode(&image)).unwrap();
        assert_eq!(back.info(), info);
        assert!(back.data().iter().all(|&b| b == 77));
    }

    #[test]
    fn rgba_encodes_as_rgb() {
        let info = ImageInfo::new(2, 1, PixelType::Rgba8);
        let image = Image::new(info, vec![1, 2, 3, 255, 4, 5, 6, 255]).unwrap();
        let back = decode(&encode(&image)).unwrap();
        assert_eq!(back.info().pixel, PixelType::Rgb8);
        assert_eq!(back.data(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn probe_reads_header_only() {
        let bytes = b"P6\n# comment\n16 16\n255\n";
        let info = probe(bytes).unwrap();
        assert_eq!(info, ImageInfo::new(16, 16, PixelType::Rgb8));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(decode(b"").is_err());
        assert!(decode(b"P3\n1 1\n255\n").is_err()); // ASCII variant
        assert!(decode(b"P6\n2 2\n65535\n").is_err()); // 16-bit
        assert!(decode(b"P6\n4 4\n255\nxx").is_err()); // truncated pixels
    }
}

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::Context;

use crate::surface::{ImageLoad, PixelSurface};

/// Where the raw XRGB8888 splash image comes from.
pub enum ImageSource {
    /// A file that every output reads from the start.
    File(PathBuf),
    /// A stream consumed in order: each output takes the next chunk of its own size.
    Stream(Box<dyn Read>),
}

impl ImageSource {
    pub fn stdin() -> Self {
        Self::Stream(Box::new(io::stdin()))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    pub fn load_into(&mut self, surface: &mut PixelSurface) -> anyhow::Result<ImageLoad> {
        match self {
            Self::File(path) => {
                let mut file =
                    File::open(&*path).with_context(|| format!("error opening {path:?}"))?;
                let len = file
                    .metadata()
                    .with_context(|| format!("error reading metadata of {path:?}"))?
                    .len();
                surface.load_image(&mut file, Some(len))
            }
            Self::Stream(reader) => {
                debug!("reading splash image from stream");
                surface.load_image(reader.as_mut(), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::tests::fixture::FakeDevice;

    #[test]
    fn stream_is_consumed_in_order() {
        let device = FakeDevice::new();
        let mut first = PixelSurface::create(&device, 2, 1).unwrap();
        let mut second = PixelSurface::create(&device, 2, 1).unwrap();
        let size = first.size();

        let data: Vec<u8> = (0..size * 2).map(|i| i as u8).collect();
        let mut source = ImageSource::Stream(Box::new(Cursor::new(data.clone())));

        source.load_into(&mut first).unwrap();
        source.load_into(&mut second).unwrap();

        assert_eq!(first.pixels().unwrap(), &data[..size]);
        assert_eq!(second.pixels().unwrap(), &data[size..]);
    }

    #[test]
    fn file_is_reread_for_every_surface() {
        let device = FakeDevice::new();
        let mut first = PixelSurface::create(&device, 2, 1).unwrap();
        let mut second = PixelSurface::create(&device, 2, 1).unwrap();
        let size = first.size();

        let path = std::env::temp_dir().join(format!("kmsplash-test-{}.raw", std::process::id()));
        let data = vec![0x42; size + 8];
        std::fs::write(&path, &data).unwrap();

        let mut source = ImageSource::File(path.clone());
        let a = source.load_into(&mut first).unwrap();
        let b = source.load_into(&mut second).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(a.size_mismatch());
        assert_eq!(a, b);
        assert_eq!(first.pixels(), second.pixels());
    }

    #[test]
    fn missing_file_is_an_error() {
        let device = FakeDevice::new();
        let mut surface = PixelSurface::create(&device, 2, 1).unwrap();
        let mut source = ImageSource::File(PathBuf::from("/nonexistent/kmsplash.raw"));
        assert!(source.load_into(&mut surface).is_err());
    }
}

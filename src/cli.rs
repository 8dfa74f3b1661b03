use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::image::ImageSource;
use crate::shutdown::Trigger;
use crate::utils::version;

#[derive(Parser, Debug)]
#[command(author, version = version(), about, long_about = None)]
pub struct Cli {
    /// DRM device to take over.
    #[arg(short, long, default_value = "/dev/dri/card0")]
    pub device: PathBuf,
    /// Raw XRGB8888 image, with rows as long as the device stride.
    ///
    /// Every display shows the whole file. Without this option the image is read from standard
    /// input, each display taking the next chunk of its own size.
    #[arg(short, long)]
    pub image: Option<PathBuf>,
    /// Give the displays back after this many seconds instead of waiting for a signal.
    #[arg(short, long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
    /// Do not detach from the terminal after reading the image from standard input.
    #[arg(short, long)]
    pub foreground: bool,
}

impl Cli {
    pub fn image_source(&self) -> ImageSource {
        match &self.image {
            Some(path) => ImageSource::File(path.clone()),
            None => ImageSource::stdin(),
        }
    }

    pub fn trigger(&self) -> Trigger {
        match self.timeout {
            Some(secs) => Trigger::After(Duration::from_secs(secs)),
            None => Trigger::Signal,
        }
    }

    /// Detaching only makes sense once the image has been read from the terminal.
    pub fn should_detach(&self) -> bool {
        self.image.is_none() && !self.foreground
    }
}

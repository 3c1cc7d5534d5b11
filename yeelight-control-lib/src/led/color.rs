use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::util::codec::hex_to_number;

/// An RGB color as the bulb understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Color {
    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        Color { red, green, blue }
    }

    /// Parses a six digit hex string such as `"1ac3ef"` or `"#FFFFFF"`.
    pub fn from_hex(hex_string: &str) -> Result<Self> {
        let digits = hex_string.trim().trim_start_matches('#');
        if digits.len() != 6 {
            bail!("Expected 6 hex digits, got {:?}", hex_string);
        }
        let value = hex_to_number(digits)
            .with_context(|| format!("Invalid hex color {:?}", hex_string))?;
        Ok(Color::from_value(value))
    }

    /// Builds a color from the packed decimal form used on the wire.
    pub fn from_value(value: u32) -> Self {
        Color {
            red: ((value >> 16) & 0xFF) as u8,
            green: ((value >> 8) & 0xFF) as u8,
            blue: (value & 0xFF) as u8,
        }
    }

    /// Packed decimal value, `red * 65536 + green * 256 + blue`.
    pub fn value(&self) -> u32 {
        (self.red as u32) * 65536 + (self.green as u32) * 256 + self.blue as u32
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper([self.red, self.green, self.blue])
    }
}

impl From<(u8, u8, u8)> for Color {
    fn from((red, green, blue): (u8, u8, u8)) -> Self {
        Color::new(red, green, blue)
    }
}

impl FromStr for Color {
    type Err = anyhow::Error;

    /// Accepts either a named color or a hex string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(named) = <CliColors as ValueEnum>::from_str(s, true) {
            return Ok(named.into());
        }
        Color::from_hex(s).map_err(|e| anyhow!("Unknown color {:?}: {}", s, e))
    }
}

/// Named colors accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliColors {
    Red,
    Green,
    Blue,
    White,
    WarmWhite,
    Yellow,
    Orange,
    Purple,
    Cyan,
    Magenta,
    Pink,
    Teal,
}

impl CliColors {
    fn rgb(self) -> (u8, u8, u8) {
        match self {
            CliColors::Red => (255, 0, 0),
            CliColors::Green => (0, 255, 0),
            CliColors::Blue => (0, 0, 255),
            CliColors::White => (255, 255, 255),
            CliColors::WarmWhite => (255, 180, 107),
            CliColors::Yellow => (255, 255, 0),
            CliColors::Orange => (255, 165, 0),
            CliColors::Purple => (128, 0, 128),
            CliColors::Cyan => (0, 255, 255),
            CliColors::Magenta => (255, 0, 255),
            CliColors::Pink => (255, 192, 203),
            CliColors::Teal => (0, 128, 128),
        }
    }
}

impl From<CliColors> for Color {
    fn from(color: CliColors) -> Self {
        color.rgb().into()
    }
}

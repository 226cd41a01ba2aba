//! Remote display (VNC) setup

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use vh_core::config::VncDisplay;
use vh_core::instance::filenames;
use vh_core::{Instance, VmDriver};

use crate::setup::write_private_file;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

/// Length of the generated display password
pub const PASSWORD_LENGTH: usize = 8;

/// Where the display ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    /// `host:number` as written to the display file
    pub display: String,
    /// `vnc://host:port`
    pub url: String,
    pub display_file: PathBuf,
    pub password_file: PathBuf,
}

/// Random password of `len` distinct characters, a quarter of them digits
pub fn generate_password(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let digits = len / 4;
    let mut chars: Vec<u8> = DIGITS.choose_multiple(&mut rng, digits).copied().collect();
    chars.extend(LETTERS.choose_multiple(&mut rng, len - digits).copied());
    chars.shuffle(&mut rng);
    chars.into_iter().map(char::from).collect()
}

/// Set a fresh display password and record how to reach the display
///
/// With a `to=` option the VM picks the port, so the real display number
/// is asked from the driver.
pub async fn setup_vnc(
    cancel: &CancellationToken,
    driver: &dyn VmDriver,
    inst: &Instance,
) -> anyhow::Result<DisplayInfo> {
    let mut display = VncDisplay::parse(&inst.config.video.vnc_display)?;

    let password = generate_password(PASSWORD_LENGTH);
    driver
        .change_display_password(cancel.clone(), &password)
        .await
        .context("failed to set the display password")?;
    let password_file = inst.path(filenames::VNC_PASSWORD);
    write_private_file(&password_file, password.as_bytes())
        .with_context(|| format!("failed to write {:?}", password_file))?;

    if display.has_port_range() {
        let conn = driver
            .display_connection(cancel.clone())
            .await
            .context("failed to get the display connection")?;
        let port: u16 = conn
            .trim()
            .parse()
            .with_context(|| format!("invalid display port {:?}", conn))?;
        display.number = port
            .checked_sub(VncDisplay::BASE_PORT)
            .ok_or_else(|| anyhow!("display port {} is below {}", port, VncDisplay::BASE_PORT))?;
    }

    let display_file = inst.path(filenames::VNC_DISPLAY);
    let display_string = display.display_string();
    write_private_file(&display_file, display_string.as_bytes())
        .with_context(|| format!("failed to write {:?}", display_file))?;

    let url = if display.host.contains(':') {
        format!("vnc://[{}]:{}", display.host, display.port())
    } else {
        format!("vnc://{}:{}", display.host, display.port())
    };
    tracing::info!("VNC server running at {} <{}>", display_string, url);
    tracing::info!("VNC display: {:?}", display_file);
    tracing::info!("VNC password: {:?}", password_file);

    Ok(DisplayInfo {
        display: display_string,
        url,
        display_file,
        password_file,
    })
}

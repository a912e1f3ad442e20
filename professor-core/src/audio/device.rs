//! Audio device selection.

/// Which side of the audio path a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "wave out",
];

/// Best-effort check for loopback capture devices. Picking one of these as
/// the microphone would feed the assistant its own voice.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Resolve a device by preferred name, falling back to the host default
/// and then to the first device listed. Loopback-like inputs are only
/// picked as a last resort.
#[cfg(feature = "audio-cpal")]
pub(crate) fn select_device(
    host: &cpal::Host,
    direction: Direction,
    preferred: Option<&str>,
) -> crate::error::Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::warn;

    use crate::error::ProfessorError;

    let mut listed = match direction {
        Direction::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
        Direction::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
    }
    .map_err(|e| ProfessorError::DeviceAcquisition(e.to_string()))?;

    if let Some(wanted) = preferred {
        if let Some(pos) = listed
            .iter()
            .position(|d| d.name().map(|n| n == wanted).unwrap_or(false))
        {
            return Ok(listed.swap_remove(pos));
        }
        warn!(?direction, "preferred device '{wanted}' not found, falling back");
    }

    let default = match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    };
    if let Some(device) = default {
        return Ok(device);
    }

    if listed.is_empty() {
        return Err(match direction {
            Direction::Input => ProfessorError::NoDefaultInputDevice,
            Direction::Output => ProfessorError::NoDefaultOutputDevice,
        });
    }
    let names: Vec<String> = listed
        .iter()
        .map(|d| d.name().unwrap_or_default())
        .collect();
    let pos = fallback_position(direction, &names);
    warn!(
        ?direction,
        device = names[pos].as_str(),
        "no default device, falling back to first available"
    );
    Ok(listed.swap_remove(pos))
}

/// Index of the fallback device among `names` (non-empty). For inputs the
/// first name that is not loopback-like wins.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn fallback_position(direction: Direction, names: &[String]) -> usize {
    match direction {
        Direction::Input => names
            .iter()
            .position(|n| !is_loopback_like_name(n))
            .unwrap_or(0),
        Direction::Output => 0,
    }
}

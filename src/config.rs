use std::path::PathBuf;

use log::*;

/// Renderer options. Defaults suit the demo; environment
/// variables override them (see [`RenderSettings::from_env`]).
#[derive(Clone, Debug, PartialEq)]
pub struct RenderSettings {
    /// Drop objects whose bounds fall outside the view frustum.
    pub frustum_culling: bool,
    /// Sort opaque objects by material and index buffer.
    pub sort_opaque: bool,
    /// Directory holding the compiled `.spv` shaders.
    pub shader_dir: PathBuf,
    pub window_extent: (u32, u32),
    pub vsync: bool,
    /// Upper bound on fence waits and image acquisition. Hitting
    /// it means the device hung.
    pub frame_timeout_ns: u64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            frustum_culling: true,
            sort_opaque: true,
            shader_dir: PathBuf::from("shaders"),
            window_extent: (1024, 576),
            vsync: true,
            frame_timeout_ns: 1_000_000_000,
        }
    }
}

fn flag_set(value: Option<String>) -> bool {
    matches!(value.as_deref().map(str::trim), Some(v) if !v.is_empty() && v != "0")
}

impl RenderSettings {
    /// Defaults, overridden by `LUMINA_SHADER_DIR`,
    /// `LUMINA_NO_CULL`, `LUMINA_NO_SORT` and `LUMINA_NO_VSYNC`.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars<F: Fn(&str) -> Option<String>>(var: F) -> Self {
        let mut settings = Self::default();

        if let Some(dir) = var("LUMINA_SHADER_DIR") {
            settings.shader_dir = PathBuf::from(dir);
        }
        if flag_set(var("LUMINA_NO_CULL")) {
            settings.frustum_culling = false;
        }
        if flag_set(var("LUMINA_NO_SORT")) {
            settings.sort_opaque = false;
        }
        if flag_set(var("LUMINA_NO_VSYNC")) {
            settings.vsync = false;
        }

        debug!("Render settings: {settings:?}");
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn with(vars: &[(&str, &str)]) -> RenderSettings {
        let vars = vars
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        RenderSettings::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn no_variables_keep_the_defaults() {
        assert_eq!(with(&[]), RenderSettings::default());
    }

    #[test]
    fn toggles_switch_features_off() {
        let settings = with(&[
            ("LUMINA_NO_CULL", "1"),
            ("LUMINA_NO_VSYNC", "yes"),
            ("LUMINA_SHADER_DIR", "/opt/shaders"),
        ]);

        assert!(!settings.frustum_culling);
        assert!(settings.sort_opaque);
        assert!(!settings.vsync);
        assert_eq!(settings.shader_dir, PathBuf::from("/opt/shaders"));
    }

    #[test]
    fn zero_or_empty_leave_a_toggle_unset() {
        let settings = with(&[("LUMINA_NO_SORT", "0"), ("LUMINA_NO_CULL", "")]);
        assert!(settings.sort_opaque);
        assert!(settings.frustum_culling);
    }
}

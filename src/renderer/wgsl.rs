//! WGSL assembly for the shader painters.
//!
//! Every shader-driven node gets one generated module: a shared fullscreen
//! vertex stage plus a fragment stage stitched from the blueprint: uniform
//! parameter slots, one texture binding per declared input socket, and one
//! color attachment per declared output socket. The fragment bodies live in
//! a small registry keyed by the blueprint's `shader` field.

use anyhow::{Result, anyhow, bail};
use std::fmt::Write as _;

use crate::blueprint::{Blueprint, ParamSpec};
use crate::value::ParamKind;

/// Uniform parameter capacity: one vec4 per slot.
pub const PARAM_SLOTS: usize = 8;

/// Passthrough used by `GpuContext::blit` for scaled readback.
pub const BLIT_SHADER: &str = r#"
struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VsOut {
    var v: VsOut;
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    v.position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    v.uv = uv;
    return v;
}

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var samp: sampler;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(src, samp, uv);
}
"#;

/// Instanced quad shader for the pattern painter. One 4x4 transform per
/// instance arrives through the instance vertex buffer; blending is a
/// pipeline state, not shader logic.
pub const PATTERN_SHADER: &str = r#"
struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(
    @location(0) pos: vec2<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) col0: vec4<f32>,
    @location(3) col1: vec4<f32>,
    @location(4) col2: vec4<f32>,
    @location(5) col3: vec4<f32>,
) -> VsOut {
    let transform = mat4x4<f32>(col0, col1, col2, col3);
    var v: VsOut;
    v.position = transform * vec4<f32>(pos, 0.0, 1.0);
    v.uv = uv;
    return v;
}

@group(0) @binding(0) var samp: sampler;
@group(0) @binding(1) var pattern: texture_2d<f32>;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(pattern, samp, uv);
}
"#;

/// Per-shader fragment code: optional module-level helpers plus the body of
/// `fs_main`. Bodies read the `let` prelude generated from the blueprint's
/// parameter schema and write into `frag.<socket>`.
struct ShaderBody {
    helpers: &'static str,
    body: &'static str,
}

fn shader_body(key: &str) -> Option<ShaderBody> {
    let entry = match key {
        "solid_color" => ShaderBody {
            helpers: "",
            body: "    frag.color = color;\n",
        },
        "fractal_noise" => ShaderBody {
            helpers: r#"
fn hash21(p: vec2<f32>) -> f32 {
    return fract(sin(dot(p, vec2<f32>(127.1, 311.7))) * 43758.5453);
}

fn value_noise(p: vec2<f32>) -> f32 {
    let i = floor(p);
    let f = fract(p);
    let u = f * f * (3.0 - 2.0 * f);
    let a = hash21(i);
    let b = hash21(i + vec2<f32>(1.0, 0.0));
    let c = hash21(i + vec2<f32>(0.0, 1.0));
    let d = hash21(i + vec2<f32>(1.0, 1.0));
    return mix(mix(a, b, u.x), mix(c, d, u.x), u.y);
}

fn fbm(p: vec2<f32>, octaves: i32) -> f32 {
    var total = 0.0;
    var amplitude = 0.5;
    var frequency = 1.0;
    for (var i = 0; i < octaves; i = i + 1) {
        if (i >= 8) { break; }
        total = total + value_noise(p * frequency) * amplitude;
        frequency = frequency * 2.0;
        amplitude = amplitude * 0.5;
    }
    return total;
}
"#,
            body: r#"    let octave_count = i32(octaves.x);
    let offset = vec2<f32>(seed.x * 17.0, seed.x * 57.0);
    let n = fbm(uv * scale.x + offset, octave_count);
    frag.color = vec4<f32>(n, n, n, 1.0);
"#,
        },
        "checker" => ShaderBody {
            helpers: "",
            body: r#"    let cell = vec2<i32>(floor(uv * count.xy));
    let parity = (cell.x + cell.y) % 2;
    frag.color = select(colorA, colorB, parity != 0);
"#,
        },
        "blend" => ShaderBody {
            helpers: "",
            body: r#"    let fg = textureSample(tex_foreground, samp_foreground, uv);
    let bg = textureSample(tex_background, samp_background, uv);
    let mask_px = textureSample(tex_mask, samp_mask, uv);
    // Unconnected mask is the transparent placeholder: full weight.
    let weight = opacity.x * mix(1.0, mask_px.r, mask_px.a);
    let m = i32(mode.x);
    var combined = fg.rgb;
    if (m == 1) {
        combined = bg.rgb + fg.rgb;
    } else if (m == 2) {
        combined = bg.rgb * fg.rgb;
    } else if (m == 3) {
        combined = bg.rgb - fg.rgb;
    }
    let t = weight * fg.a;
    frag.color = vec4<f32>(mix(bg.rgb, combined, t), max(bg.a, t));
"#,
        },
        "levels" => ShaderBody {
            helpers: "",
            body: r#"    let src = textureSample(tex_in, samp_in, uv);
    let span = max(inRange.y - inRange.x, 1e-5);
    let t = clamp((src.rgb - vec3<f32>(inRange.x)) / span, vec3<f32>(0.0), vec3<f32>(1.0));
    let g = pow(t, vec3<f32>(1.0 / max(gamma.x, 1e-5)));
    frag.color = vec4<f32>(mix(vec3<f32>(outRange.x), vec3<f32>(outRange.y), g), src.a);
"#,
        },
        "blur" => ShaderBody {
            helpers: "",
            body: r#"    let texel = 1.0 / pass_meta.resolution;
    var dir = vec2<f32>(texel.x, 0.0);
    if (pass_meta.pass_index == 1u) {
        dir = vec2<f32>(0.0, texel.y);
    }
    let radius = clamp(intensity.x, 0.0, 32.0);
    let sigma = max(radius * 0.5, 0.5);
    var acc = vec4<f32>(0.0);
    var weight_sum = 0.0;
    for (var i = -8; i <= 8; i = i + 1) {
        let offs = f32(i) * radius / 8.0;
        let w = exp(-(offs * offs) / (2.0 * sigma * sigma));
        acc = acc + textureSample(tex_in, samp_in, uv + dir * offs) * w;
        weight_sum = weight_sum + w;
    }
    frag.color = acc / weight_sum;
"#,
        },
        _ => return None,
    };
    Some(entry)
}

/// Parameters that occupy uniform slots, in declaration order. Kinds with no
/// vec4 packing (currently `Text`) are excluded; the painter logs them once.
pub fn slot_params(blueprint: &Blueprint) -> Vec<&ParamSpec> {
    blueprint
        .params
        .iter()
        .filter(|p| p.kind != ParamKind::Text)
        .collect()
}

/// Assemble the full WGSL module for a shader-driven blueprint.
pub fn generate_node_shader(blueprint: &Blueprint) -> Result<String> {
    let key = blueprint
        .shader
        .as_deref()
        .ok_or_else(|| anyhow!("blueprint '{}' declares no shader", blueprint.name))?;
    let ShaderBody { helpers, body } =
        shader_body(key).ok_or_else(|| anyhow!("unknown shader body: {key}"))?;

    let slots = slot_params(blueprint);
    if slots.len() > PARAM_SLOTS {
        bail!(
            "blueprint '{}' declares {} uniform params (max {PARAM_SLOTS})",
            blueprint.name,
            slots.len()
        );
    }
    if blueprint.outputs.is_empty() {
        bail!("blueprint '{}' declares no outputs", blueprint.name);
    }

    let mut src = String::new();
    src.push_str(&format!(
        r#"struct PassMeta {{
    resolution: vec2<f32>,
    pass_index: u32,
    _pad: u32,
}};

@group(0) @binding(0) var<uniform> params: array<vec4<f32>, {PARAM_SLOTS}>;
@group(0) @binding(1) var<uniform> pass_meta: PassMeta;
"#
    ));
    // Each input gets its own sampler so it is filtered the way its
    // producing node declares.
    for (i, socket) in blueprint.inputs.iter().enumerate() {
        let _ = writeln!(
            src,
            "@group(1) @binding({}) var tex_{socket}: texture_2d<f32>;",
            i * 2
        );
        let _ = writeln!(
            src,
            "@group(1) @binding({}) var samp_{socket}: sampler;",
            i * 2 + 1
        );
    }

    src.push_str(helpers);
    src.push_str(
        r#"
struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VsOut {
    var v: VsOut;
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    v.position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    v.uv = uv;
    return v;
}

struct FragmentOutput {
"#,
    );
    for (i, socket) in blueprint.outputs.iter().enumerate() {
        let _ = writeln!(src, "    @location({i}) {socket}: vec4<f32>,");
    }
    src.push_str("};\n\n@fragment\nfn fs_main(@location(0) uv: vec2<f32>) -> FragmentOutput {\n");
    for (i, spec) in slots.iter().enumerate() {
        let _ = writeln!(src, "    let {} = params[{i}];", spec.name);
    }
    src.push_str("    var frag: FragmentOutput;\n");
    src.push_str(body);
    src.push_str("    return frag;\n}\n");
    Ok(src)
}

/// Parse and validate a module before it reaches wgpu, so a bad generated
/// shader surfaces as a per-node error instead of a device loss.
pub fn validate_wgsl(source: &str) -> Result<()> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| anyhow!("WGSL parse failed:\n{}", numbered_source(source, &e.to_string())))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| {
        anyhow!(
            "WGSL validation failed:\n{}",
            numbered_source(source, &e.to_string())
        )
    })?;
    Ok(())
}

fn numbered_source(source: &str, error: &str) -> String {
    let mut out = format!("  {error}\n\nGenerated WGSL:\n---\n");
    for (i, line) in source.lines().enumerate() {
        let _ = writeln!(out, "{:4} | {line}", i + 1);
    }
    out.push_str("---\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::load_default_catalog;

    fn validate(source: &str) {
        if let Err(e) = validate_wgsl(source) {
            panic!("{e:#}");
        }
    }

    #[test]
    fn builtin_shaders_validate() {
        validate(BLIT_SHADER);
        validate(PATTERN_SHADER);
    }

    #[test]
    fn every_shader_blueprint_generates_valid_wgsl() {
        let catalog = load_default_catalog().unwrap();
        for name in ["solid-color", "fractal-noise", "checker", "blend", "levels", "blur"] {
            let bp = catalog.get(name).unwrap();
            let src = generate_node_shader(bp)
                .unwrap_or_else(|e| panic!("generation failed for {name}: {e}"));
            validate(&src);
        }
    }

    #[test]
    fn pass_uniform_avoids_reserved_identifiers() {
        // `meta` is a reserved word in WGSL; the per-pass uniform must be
        // declared under a name naga accepts.
        let catalog = load_default_catalog().unwrap();
        let src = generate_node_shader(catalog.get("blur").unwrap()).unwrap();
        assert!(src.contains("var<uniform> pass_meta: PassMeta;"));
        assert!(!src.contains("var<uniform> meta:"));
        assert!(src.contains("pass_meta.pass_index"));
    }

    #[test]
    fn text_params_take_no_uniform_slot() {
        let catalog = load_default_catalog().unwrap();
        let levels = catalog.get("levels").unwrap();
        let slots = slot_params(levels);
        assert!(slots.iter().all(|p| p.name != "label"));
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn validator_reports_with_a_numbered_listing() {
        let err = validate_wgsl("fn broken( -> {").unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("   1 | fn broken( -> {"));
    }

    #[test]
    fn unknown_shader_key_is_an_error() {
        let bp = Blueprint {
            name: "mystery".to_string(),
            painter: "single-pass".to_string(),
            shader: Some("does_not_exist".to_string()),
            pattern: None,
            inputs: vec![],
            outputs: vec!["color".to_string()],
            params: vec![],
            sink: false,
        };
        assert!(generate_node_shader(&bp).is_err());
    }
}

use std::{env, fs, path::PathBuf};

// Vertex input matches umbra_render::gpu::Vertex:
//   location 0 position, 1 normal, 2 uv, 3 tangent
// Sets: 0 model, 1 material, 2 light (main); 0 model, 1 light matrix (shadow).

const MAIN_VERT: &str = r#"
#version 450
layout(location = 0) in vec3 inPos;
layout(location = 1) in vec3 inNormal;
layout(location = 2) in vec2 inUv;
layout(location = 3) in vec3 inTangent;

layout(set = 0, binding = 0) uniform Model {
    mat4 model;
    mat4 view;
    mat4 proj;
    vec4 cameraPos;
} m;

layout(location = 0) out vec3 vWorldPos;
layout(location = 1) out vec3 vNormal;
layout(location = 2) out vec2 vUv;
layout(location = 3) out vec3 vTangent;

void main() {
    vec4 world = m.model * vec4(inPos, 1.0);
    mat3 normalMat = transpose(inverse(mat3(m.model)));
    vWorldPos = world.xyz;
    vNormal = normalize(normalMat * inNormal);
    vTangent = normalize(mat3(m.model) * inTangent);
    vUv = inUv;
    gl_Position = m.proj * m.view * world;
}
"#;

const MAIN_FRAG: &str = r#"
#version 450
#define MAX_LIGHTS 16
#define SLOT_ALBEDO    1u
#define SLOT_EMISSIVE  2u
#define SLOT_ROUGHNESS 4u
#define SLOT_ALPHA     8u
#define SLOT_NORMAL    16u

#define LIGHT_DIRECTIONAL 0.0
#define LIGHT_SPOT        1.0
#define LIGHT_POINT       2.0

layout(location = 0) in vec3 vWorldPos;
layout(location = 1) in vec3 vNormal;
layout(location = 2) in vec2 vUv;
layout(location = 3) in vec3 vTangent;

layout(set = 0, binding = 0) uniform Model {
    mat4 model;
    mat4 view;
    mat4 proj;
    vec4 cameraPos;
} m;

layout(set = 1, binding = 0) uniform MaterialBlock {
    vec4 albedo;
    vec4 emissive;
    vec4 params;
    uint textureSlots;
} mat;
// albedo, emissive, roughness, alpha, normal
layout(set = 1, binding = 1) uniform sampler2D textures[5];

struct Light {
    vec4 position;  // w = type
    vec4 direction; // w = range
    vec4 color;     // w = intensity
    vec4 cone;      // x = cos inner, y = cos outer
};

layout(set = 2, binding = 0) uniform LightBlock {
    Light lights[MAX_LIGHTS];
    mat4 lightSpace[4];
    vec4 ambient;
    uint lightCount;
    int shadowLight;
    uint shadowViews;
} lb;
layout(set = 2, binding = 1) uniform sampler2D shadowMap;

layout(location = 0) out vec4 outColor;

bool hasSlot(uint bit) {
    return (mat.textureSlots & bit) != 0u;
}

// Point lights render +X, -X, +Z, -Z into the four quadrants of the map.
int pointView(vec3 d) {
    if (abs(d.x) >= abs(d.z)) {
        return d.x >= 0.0 ? 0 : 1;
    }
    return d.z >= 0.0 ? 2 : 3;
}

float shadowFactor(Light light, vec3 n, vec3 l) {
    int view = 0;
    if (lb.shadowViews > 1u) {
        view = pointView(vWorldPos - light.position.xyz);
    }
    vec4 clip = lb.lightSpace[view] * vec4(vWorldPos, 1.0);
    if (clip.w <= 0.0) {
        return 1.0;
    }
    vec3 ndc = clip.xyz / clip.w;
    if (ndc.z > 1.0 || abs(ndc.x) > 1.0 || abs(ndc.y) > 1.0) {
        return 1.0;
    }
    // negative-height viewport: ndc +y is the top row
    vec2 uv = vec2(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    vec2 texel = 1.0 / vec2(textureSize(shadowMap, 0));
    vec2 lo = vec2(0.0);
    vec2 hi = vec2(1.0);
    if (lb.shadowViews > 1u) {
        vec2 quadrant = vec2(float(view % 2), float(view / 2)) * 0.5;
        uv = quadrant + uv * 0.5;
        lo = quadrant + texel;
        hi = quadrant + vec2(0.5) - texel;
    }
    float bias = max(0.0025 * (1.0 - dot(n, l)), 0.0005);
    float lit = 0.0;
    for (int x = -1; x <= 1; ++x) {
        for (int y = -1; y <= 1; ++y) {
            vec2 p = clamp(uv + vec2(x, y) * texel, lo, hi);
            float closest = texture(shadowMap, p).r;
            lit += (ndc.z - bias) > closest ? 0.0 : 1.0;
        }
    }
    return lit / 9.0;
}

vec3 surfaceNormal() {
    vec3 n = normalize(vNormal);
    if (!hasSlot(SLOT_NORMAL)) {
        return n;
    }
    vec3 t = normalize(vTangent - n * dot(n, vTangent));
    vec3 b = cross(n, t);
    vec3 tn = texture(textures[4], vUv).xyz * 2.0 - 1.0;
    return normalize(mat3(t, b, n) * tn);
}

void main() {
    vec3 albedo = mat.albedo.rgb;
    float alpha = mat.albedo.a;
    if (hasSlot(SLOT_ALBEDO)) {
        vec4 s = texture(textures[0], vUv);
        albedo *= s.rgb;
        alpha *= s.a;
    }
    if (hasSlot(SLOT_ALPHA)) {
        alpha *= texture(textures[3], vUv).r;
    }
    vec3 emissive = mat.emissive.rgb;
    if (hasSlot(SLOT_EMISSIVE)) {
        emissive *= texture(textures[1], vUv).rgb;
    }
    float roughness = mat.params.x;
    if (hasSlot(SLOT_ROUGHNESS)) {
        roughness *= texture(textures[2], vUv).r;
    }
    float shininess = max(mat.params.y, 1.0);
    float specStrength = 1.0 - clamp(roughness, 0.0, 1.0);

    vec3 n = surfaceNormal();
    vec3 v = normalize(m.cameraPos.xyz - vWorldPos);
    vec3 color = lb.ambient.rgb * albedo + emissive;

    for (uint i = 0u; i < lb.lightCount; ++i) {
        Light light = lb.lights[i];
        vec3 l;
        float attenuation = 1.0;
        if (light.position.w == LIGHT_DIRECTIONAL) {
            l = normalize(-light.direction.xyz);
        } else {
            vec3 toLight = light.position.xyz - vWorldPos;
            float dist = length(toLight);
            l = toLight / max(dist, 1e-4);
            float range = max(light.direction.w, 1e-4);
            float falloff = clamp(1.0 - pow(dist / range, 4.0), 0.0, 1.0);
            attenuation = falloff * falloff / (dist * dist + 1.0);
            if (light.position.w == LIGHT_SPOT) {
                float cosAngle = dot(-l, normalize(light.direction.xyz));
                attenuation *= smoothstep(light.cone.y, light.cone.x, cosAngle);
            }
        }
        float ndl = max(dot(n, l), 0.0);
        if (ndl <= 0.0 || attenuation <= 0.0) {
            continue;
        }
        vec3 h = normalize(l + v);
        float spec = pow(max(dot(n, h), 0.0), shininess) * specStrength;
        float shadow = int(i) == lb.shadowLight ? shadowFactor(light, n, l) : 1.0;
        vec3 radiance = light.color.rgb * light.color.w * attenuation;
        color += (albedo * ndl + vec3(spec)) * radiance * shadow;
    }

    outColor = vec4(color, alpha);
}
"#;

const SHADOW_VERT: &str = r#"
#version 450
layout(location = 0) in vec3 inPos;

layout(set = 0, binding = 0) uniform Model {
    mat4 model;
    mat4 view;
    mat4 proj;
    vec4 cameraPos;
} m;

// dynamic offset picks (frame slot, render index)
layout(set = 1, binding = 0) uniform LightMatrix { mat4 lightSpace; } lm;

void main() {
    gl_Position = lm.lightSpace * m.model * vec4(inPos, 1.0);
}
"#;

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let shaders = [
        ("main.vert", MAIN_VERT, shaderc::ShaderKind::Vertex),
        ("main.frag", MAIN_FRAG, shaderc::ShaderKind::Fragment),
        ("shadow.vert", SHADOW_VERT, shaderc::ShaderKind::Vertex),
    ];
    for (name, src, kind) in shaders {
        let spv = comp
            .compile_into_spirv(src, kind, name, "main", Some(&opts))
            .unwrap_or_else(|e| panic!("{name}: {e}"));
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8()).unwrap();
    }

    // sources are inline
    println!("cargo:rerun-if-changed=build.rs");
}

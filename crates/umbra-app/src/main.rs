// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod demo;

use anyhow::{Context, Result};
use clap::Parser;
use demo::LightChoice;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use umbra_core::{init_tracing, report_fatal};
use umbra_platform::framebuffer_size;
use umbra_render::{RenderSize, Renderer, RendererConfig, Scene};
use umbra_render_vk::VkRenderer;

use umbra_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config; missing or invalid means defaults
    #[arg(long, default_value = "umbra.toml")]
    config: PathBuf,
    /// Shadow-casting light type (overrides the config)
    #[arg(long, value_enum)]
    light: Option<LightChoice>,
    #[arg(long)]
    frames_in_flight: Option<usize>,
    #[arg(long)]
    shadow_map_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppCfg {
    render: RendererConfig,
    light: LightChoice,
}

impl AppCfg {
    fn apply(mut self, args: &Args) -> Self {
        if let Some(light) = args.light {
            self.light = light;
        }
        if let Some(n) = args.frames_in_flight {
            self.render.max_frames_in_flight = n;
        }
        if let Some(size) = args.shadow_map_size {
            self.render.shadow_map_size = size;
        }
        self
    }
}

fn parse_cfg(text: &str) -> Result<AppCfg> {
    Ok(toml::from_str(text)?)
}

fn load_cfg(path: &Path) -> AppCfg {
    let text = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => {
            info!("no config at {}, using defaults", path.display());
            return AppCfg::default();
        }
    };
    parse_cfg(&text).unwrap_or_else(|e| {
        warn!("ignoring {}: {e}", path.display());
        AppCfg::default()
    })
}

struct App {
    cfg: AppCfg,
    scene: Scene,
    // dropped before the window it renders into
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    render_size: RenderSize,
    vsync: bool,
    shadow_size: u32,

    fatal: Option<anyhow::Error>,
    frames: u32,
    last_fps_instant: Instant,
    last_frame: Instant,
}

impl App {
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop
            .create_window(Window::default_attributes().with_title("umbra"))
            .context("create_window")?;
        self.render_size = framebuffer_size(&window);

        let mut renderer =
            VkRenderer::new(&window, &window, self.render_size, &self.cfg.render)?;
        renderer.upload(&self.scene)?;
        info!(
            "renderer up: light = {:?}, {} frames in flight",
            self.cfg.light,
            renderer.frames_in_flight()
        );

        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        self.renderer = None;
        self.window = None;
        self.fatal = Some(err);
        event_loop.exit();
    }

    fn redraw(&mut self) -> Result<()> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        demo::animate(&mut self.scene, dt);

        if let Some(renderer) = &mut self.renderer {
            renderer.render(&self.scene)?;
            self.frames = self.frames.saturating_add(1);
        }
        Ok(())
    }

    fn on_key(&mut self, code: KeyCode) {
        let Some(renderer) = &mut self.renderer else {
            return;
        };
        match code {
            KeyCode::KeyV => {
                self.vsync = !self.vsync;
                renderer.set_vsync(self.vsync);
                info!("vsync = {}", self.vsync);
            }
            KeyCode::BracketRight => {
                self.shadow_size = (self.shadow_size * 2).min(8192);
                renderer.request_shadow_resize(self.shadow_size);
            }
            KeyCode::BracketLeft => {
                self.shadow_size = (self.shadow_size / 2).max(256);
                renderer.request_shadow_resize(self.shadow_size);
            }
            _ => {}
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
                return;
            }
        }
        event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                info!(
                    "Resized → {}x{}",
                    self.render_size.width, self.render_size.height
                );
                let resized = match &mut self.renderer {
                    Some(renderer) => renderer.resize(self.render_size),
                    None => Ok(()),
                };
                if let Err(e) = resized {
                    self.fail(event_loop, e);
                }
            }

            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => self.on_key(code),

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.render_size.is_empty() {
            return;
        }
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn run() -> Result<Option<anyhow::Error>> {
    let args = Args::parse();
    let cfg = load_cfg(&args.config).apply(&args);
    let scene = demo::build_scene(cfg.light)?;
    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App {
        vsync: cfg.render.vsync,
        shadow_size: cfg.render.shadow_extent(),
        cfg,
        scene,
        renderer: None,
        window: None,
        render_size: RenderSize {
            width: 1,
            height: 1,
        },
        fatal: None,
        frames: 0,
        last_fps_instant: Instant::now(),
        last_frame: Instant::now(),
    };

    event_loop.run_app(&mut app)?;
    Ok(app.fatal.take())
}

fn main() {
    init_tracing();
    let err = match run() {
        Ok(None) => return,
        Ok(Some(e)) | Err(e) => e,
    };
    report_fatal(&err);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_section_maps_to_renderer_config() {
        let cfg = parse_cfg(
            r#"
            light = "point"

            [render]
            vsync = false
            max_frames_in_flight = 2
            shadow_map_size = 1024
            shader_dir = "assets/spv"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.light, LightChoice::Point);
        assert!(!cfg.render.vsync);
        assert_eq!(cfg.render.frames_in_flight(), 2);
        assert_eq!(cfg.render.shadow_extent(), 1024);
        assert_eq!(cfg.render.shader_dir, PathBuf::from("assets/spv"));
        // untouched keys keep their defaults
        assert_eq!(cfg.render.max_materials, RendererConfig::default().max_materials);
    }

    #[test]
    fn invalid_config_is_an_error_and_missing_file_defaults() {
        assert!(parse_cfg("render = 3").is_err());
        let cfg = load_cfg(Path::new("definitely/not/here.toml"));
        assert_eq!(cfg.light, LightChoice::Directional);
    }

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from([
            "umbra",
            "--light",
            "spot",
            "--frames-in-flight",
            "1",
            "--shadow-map-size",
            "512",
        ]);
        let cfg = AppCfg::default().apply(&args);
        assert_eq!(cfg.light, LightChoice::Spot);
        assert_eq!(cfg.render.frames_in_flight(), 1);
        assert_eq!(cfg.render.shadow_extent(), 512);
        assert_eq!(args.config, PathBuf::from("umbra.toml"));
    }
}

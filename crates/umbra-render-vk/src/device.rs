// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical/logical device and the shared command pool.
//! Everything else in the backend holds an `Arc<DeviceContext>`, so the
//! device outlives every object created from it.

use crate::error::VkError;
use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils;
use ash::khr::{maintenance1, surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use std::ffi::{c_void, CStr};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const DEVICE_EXTENSIONS: [&CStr; 2] = [swapchain::NAME, maintenance1::NAME];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Pick graphics and present families. A single family that can do both is
/// preferred; otherwise the first graphics family and first present family.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let is_graphics = |f: &vk::QueueFamilyProperties| {
        f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    };

    let mut graphics = None;
    let mut present = None;
    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        let g = is_graphics(family);
        let p = family.queue_count > 0 && supports_present(i);
        if g && p {
            return Some(QueueFamilies {
                graphics: i,
                present: i,
            });
        }
        if g && graphics.is_none() {
            graphics = Some(i);
        }
        if p && present.is_none() {
            present = Some(i);
        }
    }
    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

const DEPTH_CANDIDATES: [vk::Format; 4] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM,
];

/// Prefer 32f, then packed depth/stencil, then 16-bit. The same format backs
/// the shadow map, so it must be sampleable as well as attachable.
pub fn select_depth_format(features: impl Fn(vk::Format) -> vk::FormatFeatureFlags) -> vk::Format {
    let needed =
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT | vk::FormatFeatureFlags::SAMPLED_IMAGE;
    DEPTH_CANDIDATES
        .into_iter()
        .find(|&f| features(f).contains(needed))
        .unwrap_or(vk::Format::D32_SFLOAT)
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

pub struct DeviceContext {
    _entry: Entry,
    instance: Instance,
    debug: Option<DebugMessenger>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl DeviceContext {
    // STRICT ORDER:
    // 1) instance (+ WSI extensions, + debug utils when validating)
    // 2) surface from THIS instance
    // 3) physical device chosen against THIS surface (present support)
    // 4) logical device, queues, command pool
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        validation: bool,
    ) -> Result<Arc<Self>> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        unsafe {
            let entry = Entry::linked();
            let instance = create_instance(&entry, dh, validation)?;
            let debug = if validation {
                Some(create_debug_messenger(&entry, &instance)?)
            } else {
                None
            };

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
                .context("ash_window::create_surface")?;

            let (phys, families) = pick_physical_device(&instance, &surface_loader, surface)?;
            let properties = instance.get_physical_device_properties(phys);
            let memory = instance.get_physical_device_memory_properties(phys);
            info!(
                "Vulkan device: {} (graphics family {}, present family {})",
                CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy(),
                families.graphics,
                families.present
            );

            let device = create_logical_device(&instance, phys, families)?;
            let graphics_queue = device.get_device_queue(families.graphics, 0);
            let present_queue = device.get_device_queue(families.present, 0);

            let pool_ci = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                queue_family_index: families.graphics,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let command_pool = device.create_command_pool(&pool_ci, None)?;

            Ok(Arc::new(Self {
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                phys,
                properties,
                memory,
                device,
                families,
                graphics_queue,
                present_queue,
                command_pool,
            }))
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn phys(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        props: vk::MemoryPropertyFlags,
    ) -> Result<u32, VkError> {
        (0..self.memory.memory_type_count)
            .find(|&i| {
                type_bits & (1 << i) != 0
                    && self.memory.memory_types[i as usize]
                        .property_flags
                        .contains(props)
            })
            .ok_or(VkError::NoMemoryType { type_bits, props })
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.phys, format)
        }
    }

    pub fn depth_format(&self) -> vk::Format {
        select_depth_format(|f| self.format_properties(f).optimal_tiling_features)
    }

    pub fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        Ok(unsafe { self.device.allocate_command_buffers(&ai)? })
    }

    /// Record into a throwaway command buffer, submit on the graphics queue
    /// and block until the queue is idle.
    pub fn one_shot(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let d = &self.device;
        let cmd = self.allocate_command_buffers(1)?[0];
        let result = unsafe {
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            d.begin_command_buffer(cmd, &bi)
                .and_then(|_| {
                    record(d, cmd);
                    d.end_command_buffer(cmd)
                })
                .and_then(|_| {
                    let submit = vk::SubmitInfo {
                        s_type: vk::StructureType::SUBMIT_INFO,
                        command_buffer_count: 1,
                        p_command_buffers: &cmd,
                        ..Default::default()
                    };
                    d.queue_submit(self.graphics_queue, &[submit], vk::Fence::null())
                })
                .and_then(|_| d.queue_wait_idle(self.graphics_queue))
        };
        unsafe { d.free_command_buffers(self.command_pool, &[cmd]) };
        result.map_err(VkError::from).context("one-shot submit")?;
        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(VkError::from)
            .context("device_wait_idle")?;
        Ok(())
    }
}

// STRICT TEARDOWN ORDER: command pool, device, debug messenger, surface, instance.
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
        debug!("device context destroyed");
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> Result<DebugMessenger> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .context("create_debug_utils_messenger")?;
    Ok(DebugMessenger { loader, messenger })
}

unsafe fn create_instance(
    entry: &Entry,
    display_raw: RawDisplayHandle,
    validation: bool,
) -> Result<Instance> {
    let name = c"Umbra";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: name.as_ptr(),
        application_version: 0,
        p_engine_name: name.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut extensions = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();
    let mut layers = Vec::new();
    if validation {
        let available = entry
            .enumerate_instance_layer_properties()
            .context("enumerate_instance_layer_properties")?;
        let found = available
            .iter()
            .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER);
        if !found {
            return Err(VkError::MissingLayer(
                VALIDATION_LAYER.to_string_lossy().into_owned(),
            )
            .into());
        }
        layers.push(VALIDATION_LAYER.as_ptr());
        extensions.push(debug_utils::NAME.as_ptr());
    }

    let ci = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };
    Ok(entry.create_instance(&ci, None).context("create_instance")?)
}

unsafe fn pick_physical_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?;

    for phys in devices {
        let available = instance
            .enumerate_device_extension_properties(phys)
            .unwrap_or_default();
        let has = |name: &CStr| {
            available
                .iter()
                .any(|e| e.extension_name_as_c_str() == Ok(name))
        };
        // maintenance1: negative viewport height for the Y-up flip
        if !DEVICE_EXTENSIONS.iter().all(|&name| has(name)) {
            continue;
        }

        let props = instance.get_physical_device_queue_family_properties(phys);
        let families = select_queue_families(&props, |i| {
            surface_loader
                .get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false)
        });
        let Some(families) = families else { continue };

        let formats = surface_loader
            .get_physical_device_surface_formats(phys, surface)
            .unwrap_or_default();
        let modes = surface_loader
            .get_physical_device_surface_present_modes(phys, surface)
            .unwrap_or_default();
        if formats.is_empty() || modes.is_empty() {
            continue;
        }
        return Ok((phys, families));
    }
    Err(VkError::NoSuitableDevice.into())
}

unsafe fn create_logical_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<_> = families
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let supported = instance.get_physical_device_features(phys);
    let features = vk::PhysicalDeviceFeatures {
        sampler_anisotropy: supported.sampler_anisotropy,
        ..Default::default()
    };
    let extensions: Vec<_> = DEVICE_EXTENSIONS.iter().map(|n| n.as_ptr()).collect();

    let ci = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        p_enabled_features: &features,
        ..Default::default()
    };
    Ok(instance
        .create_device(phys, &ci, None)
        .context("create_device")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_a_family_that_does_both() {
        let props = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        let picked = select_queue_families(&props, |i| i != 0).unwrap();
        assert_eq!(picked, QueueFamilies { graphics: 2, present: 2 });
        assert_eq!(picked.unique(), vec![2]);
    }

    #[test]
    fn splits_graphics_and_present_when_needed() {
        let props = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let picked = select_queue_families(&props, |i| i == 1).unwrap();
        assert_eq!(picked, QueueFamilies { graphics: 0, present: 1 });
        assert_eq!(picked.unique(), vec![0, 1]);
    }

    #[test]
    fn no_graphics_or_no_present_means_unsuitable() {
        let compute_only = [family(vk::QueueFlags::COMPUTE)];
        assert!(select_queue_families(&compute_only, |_| true).is_none());

        let graphics_only = [family(vk::QueueFlags::GRAPHICS)];
        assert!(select_queue_families(&graphics_only, |_| false).is_none());
    }

    #[test]
    fn depth_format_must_also_be_sampleable() {
        let attach = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        let both = attach | vk::FormatFeatureFlags::SAMPLED_IMAGE;

        // D32 attachable only, D24S8 both: skip to D24S8
        let picked = select_depth_format(|f| match f {
            vk::Format::D32_SFLOAT => attach,
            vk::Format::D24_UNORM_S8_UINT => both,
            _ => vk::FormatFeatureFlags::empty(),
        });
        assert_eq!(picked, vk::Format::D24_UNORM_S8_UINT);

        assert_eq!(select_depth_format(|_| both), vk::Format::D32_SFLOAT);
        let picked = select_depth_format(|f| {
            if f == vk::Format::D16_UNORM {
                both
            } else {
                attach
            }
        });
        assert_eq!(picked, vk::Format::D16_UNORM);
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let props = [empty, family(vk::QueueFlags::GRAPHICS)];
        let picked = select_queue_families(&props, |_| true).unwrap();
        assert_eq!(picked.graphics, 1);
    }
}

// Device Context - Core GPU interface
//
// Responsibilities:
// - Instance creation (+ validation layers and debug messenger when enabled)
// - Presentation surface
// - Physical device selection (first suitable, no ranking)
// - Logical device + graphics/present queues
// - Command pool for per-frame command buffers
//
// Every driver object is held by a small owning type whose Drop destroys it
// once. Field order in `DeviceContext` is the teardown order.

use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::surface::{required_instance_extensions, Surface, SurfaceSupport};
use crate::config::RendererSettings;
use crate::error::{RenderError, Result, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions every candidate GPU must expose.
pub fn required_device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

/// Graphics and present queue families, resolved together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Resolve both families from a device's queue family list.
    ///
    /// A family that does both wins outright. Otherwise the first graphics
    /// family is paired with the first presenting family.
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> Result<Option<Self>>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut graphics = None;
        let mut present = None;

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            let is_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let is_present = supports_present(index)?;

            if is_graphics && is_present {
                return Ok(Some(Self {
                    graphics: index,
                    present: index,
                }));
            }
            if is_graphics && graphics.is_none() {
                graphics = Some(index);
            }
            if is_present && present.is_none() {
                present = Some(index);
            }
        }

        Ok(graphics.zip(present).map(|(graphics, present)| Self { graphics, present }))
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// One entry per distinct family, for device queue creation.
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present].into_iter().collect();
        set.into_iter().collect()
    }

    /// Sharing mode for images touched by both queues, plus the family list
    /// that must accompany CONCURRENT sharing.
    pub fn sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        if self.is_shared() {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (vk::SharingMode::CONCURRENT, vec![self.graphics, self.present])
        }
    }
}

/// Names of `required` extensions absent from `available`.
pub fn missing_extensions(required: &[&CStr], available: &[vk::ExtensionProperties]) -> Vec<String> {
    let available: BTreeSet<&CStr> = available
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
        .collect();

    required
        .iter()
        .filter(|name| !available.contains(**name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// Whether `name` is among the instance layers in `available`.
pub fn has_layer(available: &[vk::LayerProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|layer| (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == name)
}

/// First device the probe accepts. Enumeration order decides ties.
pub fn select_first_suitable<D, F>(devices: &[D], mut probe: F) -> Result<Option<(D, QueueFamilyIndices)>>
where
    D: Copy,
    F: FnMut(D) -> Result<Option<QueueFamilyIndices>>,
{
    for &device in devices {
        if let Some(families) = probe(device)? {
            return Ok(Some((device, families)));
        }
    }
    Ok(None)
}

/// Log channel for a validation message; `None` drops it.
pub fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Option<log::Level> {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Some(log::Level::Error)
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Some(log::Level::Warn)
    } else {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Owning wrappers
// ─────────────────────────────────────────────────────────────────────────────

struct InstanceOwner {
    entry: Entry,
    instance: ash::Instance,
}

impl Drop for InstanceOwner {
    fn drop(&mut self) {
        unsafe { self.instance.destroy_instance(None) };
    }
}

struct DebugMessenger {
    loader: ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl Drop for DebugMessenger {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_debug_utils_messenger(self.messenger, None) };
    }
}

struct LogicalDevice {
    device: ash::Device,
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

struct CommandPool {
    device: ash::Device,
    pool: vk::CommandPool,
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Context
// ─────────────────────────────────────────────────────────────────────────────

/// Shared, read-only GPU context. Image chains and frame backends hold an
/// `Arc` to it, so it always outlives them.
pub struct DeviceContext {
    // Drop order: pool -> device -> surface -> messenger -> instance
    command_pool: CommandPool,
    device: LogicalDevice,
    surface: Surface,
    _debug: Option<DebugMessenger>,
    instance: InstanceOwner,

    physical_device: vk::PhysicalDevice,
    device_name: String,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    families: QueueFamilyIndices,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

impl DeviceContext {
    /// Build the full context for a native window.
    ///
    /// Any failure tears down whatever was already created and is returned.
    pub fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        settings: &RendererSettings,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device context: {}", settings.app_name);

        let entry = unsafe { Entry::load() }?;

        let instance = Self::create_instance(entry, display, &settings.app_name, settings.enable_validation)
            .map_err(|e| {
                log::error!("Failed to create Vulkan instance: {}", e);
                e
            })?;

        let debug = if settings.enable_validation {
            Some(Self::setup_debug_messenger(&instance)?)
        } else {
            None
        };

        let surface = Surface::create(&instance.entry, &instance.instance, display, window)
            .map_err(|e| {
                log::error!("Failed to create surface: {}", e);
                e
            })?;

        let (physical_device, families) = Self::pick_physical_device(&instance.instance, &surface)?;

        let properties = unsafe { instance.instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.instance.get_physical_device_memory_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        log::info!("Selected GPU: {}", device_name);
        log::info!(
            "Queue families: graphics={} present={} ({})",
            families.graphics,
            families.present,
            if families.is_shared() { "shared" } else { "separate" }
        );

        let device = Self::create_logical_device(&instance.instance, physical_device, families)?;
        let graphics_queue = unsafe { device.device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.device.get_device_queue(families.present, 0) };

        let command_pool = Self::create_command_pool(&device.device, families.graphics)?;

        log::info!("Vulkan device context initialized");

        Ok(Arc::new(Self {
            command_pool,
            device,
            surface,
            _debug: debug,
            instance,
            physical_device,
            device_name,
            memory_properties,
            families,
            graphics_queue,
            present_queue,
        }))
    }

    fn create_instance(
        entry: Entry,
        display: RawDisplayHandle,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<InstanceOwner> {
        let app_name_cstr = CString::new(app_name).unwrap_or_else(|_| c"vk-frame-core".to_owned());
        let engine_name = c"vk-frame-core";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions: Vec<*const c_char> = required_instance_extensions(display)?
            .into_iter()
            .map(CStr::as_ptr)
            .collect();

        let mut layer_names = Vec::new();
        if enable_validation {
            Self::check_validation_layers(&entry)?;
            layer_names.push(VALIDATION_LAYER.as_ptr());
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .during("Create Vulkan instance")?;

        Ok(InstanceOwner { entry, instance })
    }

    fn check_validation_layers(entry: &Entry) -> Result<()> {
        let available = entry
            .enumerate_instance_layer_properties()
            .during("Enumerate instance layers")?;

        if has_layer(&available, VALIDATION_LAYER) {
            Ok(())
        } else {
            let missing = vec![VALIDATION_LAYER.to_string_lossy().into_owned()];
            log::error!("Validation layers requested, but not available: {:?}", missing);
            Err(RenderError::MissingValidationLayers(missing))
        }
    }

    fn setup_debug_messenger(instance: &InstanceOwner) -> Result<DebugMessenger> {
        let loader = ext::DebugUtils::new(&instance.entry, &instance.instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .during("Create debug messenger")?;

        Ok(DebugMessenger { loader, messenger })
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface: &Surface,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .during("Enumerate physical devices")?;

        if devices.is_empty() {
            log::error!("No Vulkan capable devices found");
            return Err(RenderError::NoSuitableDevice);
        }

        let selected = select_first_suitable(&devices, |device| {
            Self::probe_device(instance, surface, device)
        })?;

        selected.ok_or_else(|| {
            log::error!("No suitable physical device found among {}", devices.len());
            RenderError::NoSuitableDevice
        })
    }

    /// Queue families of `device` if it meets every requirement.
    fn probe_device(
        instance: &ash::Instance,
        surface: &Surface,
        device: vk::PhysicalDevice,
    ) -> Result<Option<QueueFamilyIndices>> {
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let Some(families) = QueueFamilyIndices::find(&queue_families, |index| {
            surface.supports_present(device, index)
        })?
        else {
            return Ok(None);
        };

        let available = unsafe { instance.enumerate_device_extension_properties(device) }
            .during("Enumerate device extensions")?;
        let missing = missing_extensions(&required_device_extensions(), &available);
        if !missing.is_empty() {
            log::debug!("Skipping device: missing extensions {:?}", missing);
            return Ok(None);
        }

        if !surface.support(device)?.is_adequate() {
            log::debug!("Skipping device: no surface formats or present modes");
            return Ok(None);
        }

        Ok(Some(families))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilyIndices,
    ) -> Result<LogicalDevice> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .during("Create logical device")
            .map_err(|e| {
                log::error!("{}", e);
                e
            })?;

        Ok(LogicalDevice { device })
    }

    fn create_command_pool(device: &ash::Device, graphics_family: u32) -> Result<CommandPool> {
        // Slots reset and re-record a single buffer each frame
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .during("Create command pool")
            .map_err(|e| {
                log::error!("{}", e);
                e
            })?;

        Ok(CommandPool {
            device: device.clone(),
            pool,
        })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface.handle()
    }

    /// Fresh capability/format/mode query for the selected device.
    pub fn surface_support(&self) -> Result<SurfaceSupport> {
        self.surface.support(self.physical_device)
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool.pool
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance()
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device().device_wait_idle() }.during("Wait for device idle")
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device context...");
        if let Err(e) = self.wait_idle() {
            log::warn!("{}", e);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match severity_level(message_severity) {
        Some(log::Level::Error) => log::error!("[Vulkan] {}", message.to_string_lossy()),
        Some(_) => log::warn!("[Vulkan] {}", message.to_string_lossy()),
        None => {}
    }

    vk::FALSE
}

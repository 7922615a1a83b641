//! Vulkan context management
//!
//! Instance, surface, physical device selection and the logical device with
//! its graphics, compute, transfer and present queues. The context is built
//! once by the application and shared by reference; nothing here is global.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;
use ash::{Device, Entry, Instance};
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use thiserror::Error;

use super::window::{Window, WindowError};

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Resource with specified ID could not be found
    #[error("Resource not found: {id}")]
    ResourceNotFound {
        /// The unique identifier of the resource
        id: u64,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Window system failure
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// Shader file could not be read or parsed
    #[error("Shader error: {0}")]
    Shader(String),

    /// Queue ownership hooks were called out of order
    #[error("Queue ownership violation: expected {expected}, buffer was {actual}")]
    Ownership {
        /// State the hook requires
        expected: &'static str,
        /// State the buffer was in
        actual: &'static str,
    },
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance, with validation layers when `enable_validation` is set
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = to_cstring(app_name)?;
        let engine_name_cstr = to_cstring("TerraEngine")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let cstr_extensions = window
            .required_instance_extensions()?
            .iter()
            .map(|ext| to_cstring(ext))
            .collect::<VulkanResult<Vec<_>>>()?;
        let mut extensions: Vec<*const std::os::raw::c_char> =
            cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();

        let layer_names = if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
            vec![to_cstring(VALIDATION_LAYER)?]
        } else {
            Vec::new()
        };
        let layer_name_ptrs: Vec<*const std::os::raw::c_char> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(VulkanError::Api)? };

        let debug = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&debug_utils)?;
            log::info!("Validation layers enabled");
            Some((debug_utils, messenger))
        } else {
            None
        };

        Ok(Self { entry, instance, debug })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Routes validation messages into the `log` facade
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::trace!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

fn to_cstring(text: &str) -> VulkanResult<CString> {
    CString::new(text).map_err(|e| VulkanError::InitializationFailed(format!("Invalid C string {text:?}: {e}")))
}

/// Queue family indices chosen for each role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Family used for rendering
    pub graphics: u32,
    /// Family able to present to the surface
    pub present: u32,
    /// Family used for the terrain culling dispatch
    pub compute: u32,
    /// Family used for copies
    pub transfer: u32,
}

impl QueueFamilies {
    /// Pick families from their capability flags.
    ///
    /// Compute prefers a family without graphics (async compute), falling back
    /// to the graphics family. Transfer prefers a transfer-only family, then the
    /// compute family.
    pub fn select(families: &[vk::QueueFlags], supports_present: impl Fn(u32) -> bool) -> Option<Self> {
        let indexed = || families.iter().enumerate().map(|(i, flags)| (i as u32, *flags));

        let graphics = indexed()
            .find(|(_, flags)| flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(i, _)| i)?;
        let present = if supports_present(graphics) {
            graphics
        } else {
            indexed().map(|(i, _)| i).find(|i| supports_present(*i))?
        };
        let compute = indexed()
            .find(|(_, flags)| flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS))
            .map_or(graphics, |(i, _)| i);
        let transfer = indexed()
            .find(|(_, flags)| {
                flags.contains(vk::QueueFlags::TRANSFER)
                    && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map_or(compute, |(i, _)| i);

        Some(Self {
            graphics,
            present,
            compute,
            transfer,
        })
    }

    /// Distinct family indices, each needing one queue
    pub fn unique(&self) -> BTreeSet<u32> {
        [self.graphics, self.present, self.compute, self.transfer]
            .into_iter()
            .collect()
    }
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Chosen queue families
    pub families: QueueFamilies,
}

impl PhysicalDeviceInfo {
    /// Select the first GPU that can render and present to `surface`
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

        for device in devices {
            match Self::evaluate_device(instance, device, surface, surface_loader) {
                Ok(info) => {
                    log::info!(
                        "Selected GPU: {} (families {:?})",
                        unsafe { CStr::from_ptr(info.properties.device_name.as_ptr()).to_string_lossy() },
                        info.families
                    );
                    return Ok(info);
                }
                Err(e) => log::debug!("Skipping physical device: {e}"),
            }
        }

        Err(VulkanError::InitializationFailed("No suitable GPU found".to_string()))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_flags: Vec<vk::QueueFlags> = unsafe { instance.get_physical_device_queue_family_properties(device) }
            .iter()
            .map(|family| family.queue_flags)
            .collect();

        let families = QueueFamilies::select(&queue_flags, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        })
        .ok_or_else(|| VulkanError::InitializationFailed("No graphics/present queue family".to_string()))?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let has_swapchain = extensions.iter().any(|available| {
            let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
            name == SwapchainLoader::name()
        });
        if !has_swapchain {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            families,
        })
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue
    pub graphics_queue: vk::Queue,
    /// Surface presentation queue
    pub present_queue: vk::Queue,
    /// Compute dispatch queue
    pub compute_queue: vk::Queue,
    /// Copy queue
    pub transfer_queue: vk::Queue,
    /// Whether `drawCount > 1` indirect draws are allowed
    pub multi_draw_indirect: bool,
}

impl LogicalDevice {
    /// Create the device with one queue per unique family
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = physical
            .families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let required_extensions = [SwapchainLoader::name().as_ptr()];

        let multi_draw_indirect = physical.features.multi_draw_indirect == vk::TRUE;
        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical.features.sampler_anisotropy == vk::TRUE)
            .multi_draw_indirect(multi_draw_indirect)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features);

        let device = unsafe {
            instance
                .create_device(physical.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let families = physical.families;
        let (graphics_queue, present_queue, compute_queue, transfer_queue) = unsafe {
            (
                device.get_device_queue(families.graphics, 0),
                device.get_device_queue(families.present, 0),
                device.get_device_queue(families.compute, 0),
                device.get_device_queue(families.transfer, 0),
            )
        };

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            compute_queue,
            transfer_queue,
            multi_draw_indirect,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Owns the core Vulkan objects every other resource is created from
pub struct VulkanContext {
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    physical_device: PhysicalDeviceInfo,
    // Field order matters: the device must be destroyed before the instance
    device: LogicalDevice,
    instance: VulkanInstance,
}

impl VulkanContext {
    /// Create a new Vulkan context for the window
    pub fn new(window: &mut Window, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(window, app_name, enable_validation)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window.create_vulkan_surface(instance.instance.handle())?;

        let physical_device =
            PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        Ok(Self {
            surface,
            surface_loader,
            physical_device,
            device,
            instance,
        })
    }

    /// Vulkan entry point
    pub fn entry(&self) -> &Entry {
        &self.instance.entry
    }

    /// Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Window surface
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Surface extension loader
    pub fn surface_loader(&self) -> &Surface {
        &self.surface_loader
    }

    /// Selected physical device
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical_device
    }

    /// Logical device
    pub fn device(&self) -> &Device {
        &self.device.device
    }

    /// Queue family indices
    pub fn families(&self) -> QueueFamilies {
        self.physical_device.families
    }

    /// Graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    /// Present queue
    pub fn present_queue(&self) -> vk::Queue {
        self.device.present_queue
    }

    /// Compute queue
    pub fn compute_queue(&self) -> vk::Queue {
        self.device.compute_queue
    }

    /// Transfer queue
    pub fn transfer_queue(&self) -> vk::Queue {
        self.device.transfer_queue
    }

    /// Whether one indirect draw may cover several commands
    pub fn supports_multi_draw_indirect(&self) -> bool {
        self.device.multi_draw_indirect
    }

    /// Minimum alignment for uniform buffer offsets
    pub fn min_uniform_alignment(&self) -> vk::DeviceSize {
        self.physical_device.properties.limits.min_uniform_buffer_offset_alignment
    }

    /// Find a memory type index matching `type_filter` with all `properties`
    pub fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> VulkanResult<u32> {
        select_memory_type(&self.physical_device.memory_properties, type_filter, properties)
            .ok_or(VulkanError::NoSuitableMemoryType)
    }

    /// First depth format usable as an optimal-tiling depth attachment
    pub fn find_depth_format(&self) -> VulkanResult<vk::Format> {
        [vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT]
            .into_iter()
            .find(|format| {
                let props = unsafe {
                    self.instance()
                        .get_physical_device_format_properties(self.physical_device.device, *format)
                };
                props
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            })
            .ok_or_else(|| VulkanError::InitializationFailed("No supported depth format".to_string()))
    }

    /// Wait for all queues to finish
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device().device_wait_idle().map_err(VulkanError::Api) }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

/// Pure memory-type search over the device's memory properties
pub fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_prefers_dedicated_compute_and_transfer() {
        let families = [
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::TRANSFER,
        ];
        let selected = QueueFamilies::select(&families, |i| i == 0).unwrap();
        assert_eq!(selected.graphics, 0);
        assert_eq!(selected.present, 0);
        assert_eq!(selected.compute, 1);
        assert_eq!(selected.transfer, 2);
        assert_eq!(selected.unique().len(), 3);
    }

    #[test]
    fn test_select_falls_back_to_graphics_family() {
        let families = [vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER];
        let selected = QueueFamilies::select(&families, |_| true).unwrap();
        assert_eq!(selected.compute, 0);
        assert_eq!(selected.transfer, 0);
        assert_eq!(selected.unique().len(), 1);
    }

    #[test]
    fn test_select_finds_separate_present_family() {
        let families = [vk::QueueFlags::GRAPHICS, vk::QueueFlags::TRANSFER];
        let selected = QueueFamilies::select(&families, |i| i == 1).unwrap();
        assert_eq!(selected.present, 1);
    }

    #[test]
    fn test_select_requires_graphics() {
        let families = [vk::QueueFlags::COMPUTE];
        assert!(QueueFamilies::select(&families, |_| true).is_none());
    }

    #[test]
    fn test_select_memory_type_honours_filter_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(select_memory_type(&props, 0b111, host), Some(1));
        assert_eq!(select_memory_type(&props, 0b100, host), Some(2));
        assert_eq!(select_memory_type(&props, 0b001, host), None);
    }
}

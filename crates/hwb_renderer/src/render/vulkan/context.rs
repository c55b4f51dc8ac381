//! Vulkan device context
//!
//! Owns the instance, the selected adapter, the logical device with its queue,
//! the command pool and the pipeline cache. Every other resource holds an
//! `Arc<DeviceContext>`, so the device is destroyed only after the last image,
//! buffer or swapchain created from it.

use std::collections::HashSet;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk::{self, Handle};
use ash::{Device, Entry, Instance};
use thiserror::Error;

use crate::assets::{AssetError, AssetSource};
use crate::core::config::RendererConfig;
use crate::render::vulkan::commands::CommandPool;
use crate::render::vulkan::memory::find_memory_type;
use crate::render::vulkan::sync::Fence;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Operation called in a lifecycle state that does not allow it
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// What was attempted
        operation: &'static str,
        /// State the component was in
        state: String,
    },

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No adapter exposes a graphics + compute queue family
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found (type bits {type_bits:#b}, properties {properties:?})")]
    NoSuitableMemoryType {
        /// Allowed memory type bits
        type_bits: u32,
        /// Requested property flags
        properties: vk::MemoryPropertyFlags,
    },

    /// A bounded wait expired
    #[error("Timed out waiting for {what} after {timeout_ns} ns")]
    Timeout {
        /// What was being waited on
        what: &'static str,
        /// Bound that expired
        timeout_ns: u64,
    },

    /// The swapchain no longer matches the surface and must be recreated
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// External buffer import failed
    #[error(transparent)]
    Import(#[from] ImportError),

    /// Asset could not be loaded
    #[error(transparent)]
    Asset(#[from] AssetError),

    /// Feature declared but not available
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Why an external hardware buffer could not be imported
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    /// Transient condition; the same buffer may import on a later frame
    #[error("Import failed, retry possible: {0}")]
    Retryable(String),

    /// This buffer can never be imported on this device
    #[error("Buffer cannot be imported: {0}")]
    Unsupported(String),
}

impl ImportError {
    /// Whether a later attempt with the same buffer could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Classify a failed device call made while importing
    pub fn from_result(step: &str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS
            | vk::Result::ERROR_FRAGMENTATION
            | vk::Result::TIMEOUT
            | vk::Result::NOT_READY => Self::Retryable(format!("{}: {:?}", step, result)),
            _ => Self::Unsupported(format!("{}: {:?}", step, result)),
        }
    }
}

/// Finish a bounded fence wait so the submission is no longer pending
///
/// A timed-out wait falls back to `drain`, which must block until the queue
/// is idle. The original timeout is returned unless draining fails too.
pub(crate) fn settle_bounded_wait(waited: VulkanResult<()>, drain: impl FnOnce() -> VulkanResult<()>) -> VulkanResult<()> {
    match waited {
        Err(VulkanError::Timeout { what, timeout_ns }) => {
            log::error!("{} still pending after {} ns, waiting for the device to go idle", what, timeout_ns);
            drain()?;
            Err(VulkanError::Timeout { what, timeout_ns })
        }
        other => other,
    }
}

/// `vkGetAndroidHardwareBufferPropertiesANDROID`
type PfnGetAndroidHardwareBufferProperties = unsafe extern "system" fn(
    device: vk::Device,
    buffer: *const c_void,
    properties: *mut vk::AndroidHardwareBufferPropertiesANDROID,
) -> vk::Result;

const ENGINE_NAME: &[u8] = b"hwb_renderer\0";
const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";
const GET_AHB_PROPERTIES: &[u8] = b"vkGetAndroidHardwareBufferPropertiesANDROID\0";

/// Instance extensions for presentation and external memory queries
pub fn instance_extension_names(enable_validation: bool) -> Vec<&'static CStr> {
    let mut names = vec![
        Surface::name(),
        vk::KhrExternalMemoryCapabilitiesFn::name(),
        vk::KhrExternalSemaphoreCapabilitiesFn::name(),
        vk::KhrGetPhysicalDeviceProperties2Fn::name(),
    ];
    #[cfg(target_os = "android")]
    names.push(ash::extensions::khr::AndroidSurface::name());
    if enable_validation {
        names.push(DebugUtils::name());
    }
    names
}

/// Device extensions needed for hardware buffer import and presentation
pub fn device_extension_names() -> Vec<&'static CStr> {
    #[allow(unused_mut)]
    let mut names = vec![
        SwapchainLoader::name(),
        vk::KhrExternalMemoryFn::name(),
        vk::KhrGetMemoryRequirements2Fn::name(),
        vk::KhrSamplerYcbcrConversionFn::name(),
        vk::KhrMaintenance1Fn::name(),
        vk::KhrBindMemory2Fn::name(),
        vk::KhrDedicatedAllocationFn::name(),
    ];
    #[cfg(target_os = "android")]
    names.extend([
        vk::AndroidExternalMemoryAndroidHardwareBufferFn::name(),
        vk::ExtQueueFamilyForeignFn::name(),
        vk::KhrExternalSemaphoreFn::name(),
        vk::KhrExternalSemaphoreFdFn::name(),
    ]);
    names
}

/// Names in `required` that `available` does not contain
pub fn missing_extensions(available: &HashSet<CString>, required: &[&CStr]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !available.contains(**name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// Index of the first queue family that supports graphics and compute
pub fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    families
        .iter()
        .position(|family| family.queue_count > 0 && family.queue_flags.contains(wanted))
        .and_then(|index| u32::try_from(index).ok())
}

/// Depth formats in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 5] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First candidate usable as an optimal-tiling depth/stencil attachment
pub fn pick_depth_format(format_properties: impl Fn(vk::Format) -> vk::FormatProperties) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES.into_iter().find(|&format| {
        format_properties(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension, present when validation is enabled
    pub debug_utils: Option<DebugUtils>,
    /// Debug messenger handle, present when validation is enabled
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance, optionally with validation
    pub fn new(app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| VulkanError::InitializationFailed("Application name contains NUL".to_string()))?;
        let engine_name = unsafe { CStr::from_bytes_with_nul_unchecked(ENGINE_NAME) };
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let validation_layer = unsafe { CStr::from_bytes_with_nul_unchecked(VALIDATION_LAYER) };
        let enable_validation = enable_validation && Self::has_layer(&entry, validation_layer);

        let extensions: Vec<*const c_char> = instance_extension_names(enable_validation)
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let layer_names: Vec<*const c_char> = if enable_validation {
            vec![validation_layer.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => (Some(debug_utils), Some(messenger)),
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err);
                }
            }
        } else {
            (None, None)
        };

        log::info!(
            "Vulkan instance created (validation {})",
            if enable_validation { "on" } else { "off" }
        );

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
        })
    }

    fn has_layer(entry: &Entry, wanted: &CStr) -> bool {
        let available = entry.enumerate_instance_layer_properties().unwrap_or_default();
        let found = available
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == wanted);
        if !found {
            log::warn!("{} requested but not installed", wanted.to_string_lossy());
        }
        found
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
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
            if let (Some(debug_utils), Some(debug_messenger)) = (&self.debug_utils, &self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!(target: "vulkan", "{:?} - {}", message_type, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!(target: "vulkan", "{:?} - {}", message_type, message);
    } else {
        log::debug!(target: "vulkan", "{:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Available queue families
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Graphics + compute queue family
    pub queue_family: u32,
    /// Supported device extensions
    pub extensions: HashSet<CString>,
}

impl PhysicalDeviceInfo {
    /// Pick the first adapter with a graphics + compute queue family
    pub fn select(instance: &Instance) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

        for device in devices {
            let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
            let Some(queue_family) = select_queue_family(&queue_families) else {
                continue;
            };

            let properties = unsafe { instance.get_physical_device_properties(device) };
            let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
            let extensions = unsafe {
                instance
                    .enumerate_device_extension_properties(device)
                    .map_err(VulkanError::Api)?
            }
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }.to_owned())
            .collect();

            let info = Self {
                device,
                properties,
                memory_properties,
                queue_families,
                queue_family,
                extensions,
            };
            log::info!("Selected GPU: {} (queue family {})", info.name(), queue_family);
            return Ok(info);
        }

        Err(VulkanError::NoSuitableDevice)
    }

    /// Adapter name as reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics queue, also used for presentation
    pub graphics_queue: vk::Queue,
    /// Compute queue; aliases the graphics queue when the family has one queue
    pub compute_queue: vk::Queue,
    /// Queue family of both queues
    pub queue_family: u32,
}

impl LogicalDevice {
    /// Create the device with the import extension set and YCbCr sampling enabled
    pub fn new(instance: &Instance, physical_device: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let required = device_extension_names();
        let missing = missing_extensions(&physical_device.extensions, &required);
        if !missing.is_empty() {
            return Err(VulkanError::InitializationFailed(format!(
                "Required device extensions not supported: {}",
                missing.join(", ")
            )));
        }

        let mut supported_ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut supported_ycbcr);
            unsafe { instance.get_physical_device_features2(physical_device.device, &mut features2) };
        }
        if supported_ycbcr.sampler_ycbcr_conversion != vk::TRUE {
            return Err(VulkanError::InitializationFailed(
                "samplerYcbcrConversion feature not supported".to_string(),
            ));
        }

        let family = physical_device.queue_family;
        let queue_count = physical_device.queue_families[family as usize].queue_count.min(2);
        let priorities = vec![1.0_f32; queue_count as usize];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(family)
            .queue_priorities(&priorities)
            .build()];

        let extension_ptrs: Vec<*const c_char> = required.iter().map(|name| name.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();
        let mut enable_ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures {
            sampler_ycbcr_conversion: vk::TRUE,
            ..Default::default()
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features)
            .push_next(&mut enable_ycbcr);

        let device = unsafe {
            instance
                .create_device(physical_device.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(family, 0) };
        let compute_queue = unsafe { device.get_device_queue(family, queue_count - 1) };

        log::info!(
            "Logical device created with {} extensions, {} queue(s)",
            required.len(),
            queue_count
        );

        Ok(Self {
            device,
            graphics_queue,
            compute_queue,
            queue_family: family,
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

/// Shared device context
///
/// Field order matters: the command pool goes before the device, the device
/// before the instance.
pub struct DeviceContext {
    command_pool: CommandPool,
    pipeline_cache: vk::PipelineCache,
    get_hardware_buffer_properties: Option<PfnGetAndroidHardwareBufferProperties>,
    assets: Arc<dyn AssetSource>,
    single_time_command_timeout_ns: u64,
    debug_naming: bool,
    device: LogicalDevice,
    physical_device: PhysicalDeviceInfo,
    instance: VulkanInstance,
}

impl DeviceContext {
    /// Bring up instance, adapter, device, command pool and pipeline cache
    pub fn initialize(assets: Arc<dyn AssetSource>, config: &RendererConfig) -> VulkanResult<Arc<Self>> {
        let debug = config.debug_enabled();
        let instance = VulkanInstance::new(&config.application_name, debug)?;
        let physical_device = PhysicalDeviceInfo::select(&instance.instance)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        let command_pool = CommandPool::new(device.device.clone(), device.queue_family)?;

        let pipeline_cache = unsafe {
            device
                .device
                .create_pipeline_cache(&vk::PipelineCacheCreateInfo::builder(), None)
                .map_err(VulkanError::Api)?
        };

        let get_hardware_buffer_properties = Self::load_hardware_buffer_fn(&instance.instance, &device.device);
        if get_hardware_buffer_properties.is_none() {
            log::warn!("Hardware buffer import unavailable on this device");
        }

        let context = Self {
            command_pool,
            pipeline_cache,
            get_hardware_buffer_properties,
            assets,
            single_time_command_timeout_ns: config.single_time_command_timeout_ns,
            debug_naming: instance.debug_utils.is_some(),
            device,
            physical_device,
            instance,
        };
        context.set_object_name(context.device.graphics_queue, "graphics-queue");
        context.set_object_name(context.command_pool.handle(), "command-pool");

        Ok(Arc::new(context))
    }

    fn load_hardware_buffer_fn(instance: &Instance, device: &Device) -> Option<PfnGetAndroidHardwareBufferProperties> {
        let name = CStr::from_bytes_with_nul(GET_AHB_PROPERTIES).ok()?;
        let function = unsafe { instance.get_device_proc_addr(device.handle(), name.as_ptr()) }?;
        Some(unsafe {
            std::mem::transmute::<unsafe extern "system" fn(), PfnGetAndroidHardwareBufferProperties>(function)
        })
    }

    /// Get the Vulkan entry
    pub fn entry(&self) -> &Entry {
        &self.instance.entry
    }

    /// Get the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the logical device
    pub fn device(&self) -> &Device {
        &self.device.device
    }

    /// Get the physical device info
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical_device
    }

    /// Graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    /// Compute queue (may alias the graphics queue)
    pub fn compute_queue(&self) -> vk::Queue {
        self.device.compute_queue
    }

    /// Queue family of the command pool and both queues
    pub fn queue_family_index(&self) -> u32 {
        self.device.queue_family
    }

    /// Pipeline cache shared by all pipelines
    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    /// Command pool for the graphics family
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    /// Asset source for shaders and other blobs
    pub fn assets(&self) -> &dyn AssetSource {
        self.assets.as_ref()
    }

    /// Memory heaps and types of the adapter
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.physical_device.memory_properties
    }

    /// Resolve a memory type index, see [`find_memory_type`]
    pub fn memory_type_index(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
        external: bool,
    ) -> VulkanResult<u32> {
        find_memory_type(self.memory_properties(), type_bits, properties, external)
    }

    /// Best depth/stencil format for optimal tiling
    pub fn supported_depth_format(&self) -> VulkanResult<vk::Format> {
        pick_depth_format(|format| unsafe {
            self.instance()
                .get_physical_device_format_properties(self.physical_device.device, format)
        })
        .ok_or_else(|| VulkanError::InitializationFailed("No supported depth format".to_string()))
    }

    /// Allocate and begin a one-shot primary command buffer
    pub fn begin_single_time_command(&self) -> VulkanResult<vk::CommandBuffer> {
        let command_buffer = self
            .command_pool
            .allocate_command_buffers(1)?
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: "Command buffer allocation returned nothing".to_string(),
            })?;

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(err) = unsafe { self.device().begin_command_buffer(command_buffer, &begin_info) } {
            self.command_pool.free_command_buffers(&[command_buffer]);
            return Err(VulkanError::Api(err));
        }

        Ok(command_buffer)
    }

    /// End, submit and wait for a one-shot command buffer
    ///
    /// Blocks on a temporary fence, so nothing the buffer references is in use
    /// by the device once this returns. When the bounded wait expires the
    /// device is drained before the fence and buffer are released, and the
    /// timeout is still reported.
    pub fn end_and_submit_single_time_command(
        &self,
        command_buffer: vk::CommandBuffer,
        queue: vk::Queue,
        free: bool,
    ) -> VulkanResult<()> {
        let command_buffers = [command_buffer];

        let submitted = unsafe { self.device().end_command_buffer(command_buffer) }
            .map_err(VulkanError::Api)
            .and_then(|()| Fence::new(self.device().clone(), false))
            .and_then(|fence| {
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
                unsafe {
                    self.device()
                        .queue_submit(queue, &[submit_info], fence.handle())
                        .map_err(VulkanError::Api)?;
                }
                Ok(fence)
            });

        let fence = match submitted {
            Ok(fence) => fence,
            Err(err) => {
                if free {
                    self.command_pool.free_command_buffers(&command_buffers);
                }
                return Err(err);
            }
        };

        let waited = settle_bounded_wait(fence.wait(self.single_time_command_timeout_ns), || self.wait_idle());

        if free {
            self.command_pool.free_command_buffers(&command_buffers);
        }
        drop(fence);
        waited
    }

    /// Query import properties of an `AHardwareBuffer`
    ///
    /// # Safety
    /// `buffer` must point to a live hardware buffer and `properties` must be a
    /// correctly chained output structure.
    pub(crate) unsafe fn hardware_buffer_properties(
        &self,
        buffer: *const c_void,
        properties: &mut vk::AndroidHardwareBufferPropertiesANDROID,
    ) -> VulkanResult<()> {
        let query = self.get_hardware_buffer_properties.ok_or_else(|| {
            ImportError::Unsupported("VK_ANDROID_external_memory_android_hardware_buffer not loaded".to_string())
        })?;

        match query(self.device().handle(), buffer, properties) {
            vk::Result::SUCCESS => Ok(()),
            result => Err(ImportError::from_result("vkGetAndroidHardwareBufferPropertiesANDROID", result).into()),
        }
    }

    /// Label an object for validation output and capture tools
    ///
    /// No-op unless validation is enabled in the renderer configuration.
    pub fn set_object_name<H: Handle>(&self, handle: H, name: &str) {
        if !self.debug_naming {
            return;
        }
        let Some(debug_utils) = self.instance.debug_utils.as_ref() else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);

        if let Err(err) = unsafe { debug_utils.set_debug_utils_object_name(self.device().handle(), &name_info) } {
            log::debug!("Failed to name {:?}: {:?}", H::TYPE, err);
        }
    }

    /// Wait for all outstanding device work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device().device_wait_idle().map_err(VulkanError::Api) }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.device.device.destroy_pipeline_cache(self.pipeline_cache, None);
        }
        // Remaining fields drop in declaration order: command pool, device, instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, queue_count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_timed_out_single_time_wait_drains_device() {
        let mut drained = 0;
        let result = settle_bounded_wait(
            Err(VulkanError::Timeout {
                what: "fence",
                timeout_ns: 5,
            }),
            || {
                drained += 1;
                Ok(())
            },
        );
        assert_eq!(drained, 1);
        assert!(matches!(result, Err(VulkanError::Timeout { timeout_ns: 5, .. })));

        let result = settle_bounded_wait(Ok(()), || {
            drained += 1;
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(drained, 1);

        let result = settle_bounded_wait(Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST)), || {
            drained += 1;
            Ok(())
        });
        assert!(matches!(result, Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))));
        assert_eq!(drained, 1);
    }

    #[test]
    fn test_queue_family_needs_graphics_and_compute() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 0),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 4),
        ];
        assert_eq!(select_queue_family(&families), Some(3));
        assert_eq!(select_queue_family(&families[..3]), None);
    }

    #[test]
    fn test_missing_extensions_reported_by_name() {
        let available: HashSet<CString> = [SwapchainLoader::name(), vk::KhrBindMemory2Fn::name()]
            .iter()
            .map(|name| (*name).to_owned())
            .collect();

        let missing = missing_extensions(
            &available,
            &[SwapchainLoader::name(), vk::KhrSamplerYcbcrConversionFn::name()],
        );
        assert_eq!(missing, vec!["VK_KHR_sampler_ycbcr_conversion".to_string()]);
    }

    #[test]
    fn test_device_extensions_cover_import_path() {
        let names = device_extension_names();
        for required in [
            SwapchainLoader::name(),
            vk::KhrSamplerYcbcrConversionFn::name(),
            vk::KhrBindMemory2Fn::name(),
            vk::KhrDedicatedAllocationFn::name(),
            vk::KhrExternalMemoryFn::name(),
        ] {
            assert!(names.contains(&required), "missing {:?}", required);
        }
    }

    #[test]
    fn test_debug_utils_only_with_validation() {
        assert!(instance_extension_names(true).contains(&DebugUtils::name()));
        assert!(!instance_extension_names(false).contains(&DebugUtils::name()));
    }

    #[test]
    fn test_depth_format_preference() {
        let supported = [vk::Format::D24_UNORM_S8_UINT, vk::Format::D16_UNORM];
        let picked = pick_depth_format(|format| vk::FormatProperties {
            optimal_tiling_features: if supported.contains(&format) {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            },
            ..Default::default()
        });
        assert_eq!(picked, Some(vk::Format::D24_UNORM_S8_UINT));
        assert_eq!(pick_depth_format(|_| vk::FormatProperties::default()), None);
    }

    #[test]
    fn test_import_error_classification() {
        assert!(ImportError::from_result("alloc", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_retryable());
        assert!(!ImportError::from_result("props", vk::Result::ERROR_INVALID_EXTERNAL_HANDLE).is_retryable());
        assert!(!ImportError::from_result("image", vk::Result::ERROR_FORMAT_NOT_SUPPORTED).is_retryable());
    }
}

// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation for the target window
// - Physical device selection (graphics + present queue families)
// - Logical device + queue creation

use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::error::{BackendError, BackendResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Highest MSAA level we ever ask for
const MAX_SAMPLE_COUNT: vk::SampleCountFlags = vk::SampleCountFlags::TYPE_64;

/// Window the device is going to present to
#[derive(Clone, Copy, Debug)]
pub struct SurfaceTarget {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// Queue families used for rendering and presentation (may be the same family)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Capabilities of one queue family, as seen from our surface
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueFamilySupport {
    pub graphics: bool,
    pub present: bool,
}

/// Everything device selection needs to know about a GPU
#[derive(Clone, Debug, Default)]
pub struct DeviceCandidate {
    pub name: String,
    pub queue_families: Vec<QueueFamilySupport>,
    pub sampler_anisotropy: bool,
    pub extensions: Vec<CString>,
    pub surface_format_count: usize,
    pub present_mode_count: usize,
}

/// What a GPU has to offer to be picked
#[derive(Clone, Debug, Default)]
pub struct DeviceRequirements {
    pub extensions: Vec<&'static CStr>,
    /// Require at least one surface format and present mode
    pub presentation: bool,
}

/// Result of device selection
#[derive(Clone, Copy, Debug)]
pub struct PhysicalDeviceChoice {
    pub physical_device: vk::PhysicalDevice,
    pub queue_families: QueueFamilyIndices,
    pub msaa_samples: vk::SampleCountFlags,
}

/// Resolve graphics and present families.
///
/// Scans in order and stops as soon as both are known, so a family that can do
/// both wins over an earlier graphics-only family.
pub fn find_queue_families(families: &[QueueFamilySupport]) -> Option<QueueFamilyIndices> {
    let mut graphics = None;
    let mut present = None;

    for (index, family) in families.iter().enumerate() {
        if family.graphics {
            graphics = Some(index as u32);
        }
        if family.present {
            present = Some(index as u32);
        }
        if let (Some(graphics), Some(present)) = (graphics, present) {
            return Some(QueueFamilyIndices { graphics, present });
        }
    }

    None
}

/// Pick the first candidate satisfying every requirement
pub fn select_device(
    candidates: &[DeviceCandidate],
    requirements: &DeviceRequirements,
) -> BackendResult<(usize, QueueFamilyIndices)> {
    for (index, candidate) in candidates.iter().enumerate() {
        let Some(families) = find_queue_families(&candidate.queue_families) else {
            log::debug!("Rejecting {}: missing queue families", candidate.name);
            continue;
        };

        if !candidate.sampler_anisotropy {
            log::debug!("Rejecting {}: no sampler anisotropy", candidate.name);
            continue;
        }

        let missing = requirements
            .extensions
            .iter()
            .find(|&&required| !candidate.extensions.iter().any(|ext| ext.as_c_str() == required));
        if let Some(missing) = missing {
            log::debug!("Rejecting {}: missing extension {:?}", candidate.name, missing);
            continue;
        }

        if requirements.presentation
            && (candidate.surface_format_count == 0 || candidate.present_mode_count == 0)
        {
            log::debug!("Rejecting {}: inadequate swapchain support", candidate.name);
            continue;
        }

        return Ok((index, families));
    }

    Err(BackendError::NoSuitableDevice)
}

/// Highest sample count usable for both colour and depth attachments
pub fn max_usable_sample_count(limits: &vk::PhysicalDeviceLimits) -> vk::SampleCountFlags {
    let counts = limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;

    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .filter(|&count| count.as_raw() <= MAX_SAMPLE_COUNT.as_raw())
    .find(|&count| counts.contains(count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Returns the first required layer missing from `available`
pub fn missing_layer<'a>(required: &[&'a CStr], available: &[&CStr]) -> Option<&'a CStr> {
    required
        .iter()
        .copied()
        .find(|&layer| !available.iter().any(|&name| name == layer))
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Presentation (surface is None for headless devices)
    pub surface_loader: ash::khr::surface::Instance,
    surface: Option<vk::SurfaceKHR>,

    // Queue handles
    pub queue_families: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub msaa_samples: vk::SampleCountFlags,
    pub sample_rate_shading: bool,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `target` - Window to present to, `None` for a headless device
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        target: Option<SurfaceTarget>,
    ) -> BackendResult<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load()? };

        let instance =
            Self::create_instance(&entry, app_name, enable_validation, target.map(|t| t.display))?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = match target {
            Some(target) => Some(unsafe {
                ash_window::create_surface(&entry, &instance, target.display, target.window, None)?
            }),
            None => None,
        };

        let choice = Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let properties = unsafe { instance.get_physical_device_properties(choice.physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(choice.physical_device) };
        let features = unsafe { instance.get_physical_device_features(choice.physical_device) };
        let sample_rate_shading = features.sample_rate_shading == vk::TRUE;

        log::info!(
            "Selected GPU: {}",
            properties.device_name_as_c_str().unwrap_or(c"<unnamed>").to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={}, MSAA: {:?}",
            choice.queue_families.graphics,
            choice.queue_families.present,
            choice.msaa_samples
        );

        let device = Self::create_logical_device(
            &instance,
            choice.physical_device,
            choice.queue_families,
            surface.is_some(),
            sample_rate_shading,
        )?;

        let graphics_queue = unsafe { device.get_device_queue(choice.queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(choice.queue_families.present, 0) };

        Ok(Arc::new(Self {
            device,
            physical_device: choice.physical_device,
            instance,
            _entry: entry,
            surface_loader,
            surface,
            queue_families: choice.queue_families,
            graphics_queue,
            present_queue,
            debug_utils,
            properties,
            memory_properties,
            msaa_samples: choice.msaa_samples,
            sample_rate_shading,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: Option<RawDisplayHandle>,
    ) -> BackendResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name).unwrap_or_default();

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"model-renderer")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        // Surface extensions for this platform
        let mut extensions: Vec<*const c_char> = match display {
            Some(display) => ash_window::enumerate_required_extensions(display)?.to_vec(),
            None => Vec::new(),
        };

        let layer_names = if enable_validation {
            Self::check_validation_layer_support(entry)?;
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Also catches messages from instance creation itself
        let mut debug_info = debug_messenger_info();
        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if enable_validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None)? };

        Ok(instance)
    }

    fn check_validation_layer_support(entry: &Entry) -> BackendResult<()> {
        let layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let available: Vec<&CStr> = layers
            .iter()
            .filter_map(|layer| layer.layer_name_as_c_str().ok())
            .collect();

        match missing_layer(&[VALIDATION_LAYER], &available) {
            Some(layer) => Err(BackendError::ValidationLayersUnavailable(
                layer.to_string_lossy().into_owned(),
            )),
            None => Ok(()),
        }
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> BackendResult<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);
        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&debug_messenger_info(), None)? };

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: Option<vk::SurfaceKHR>,
    ) -> BackendResult<PhysicalDeviceChoice> {
        let devices = unsafe { instance.enumerate_physical_devices()? };
        if devices.is_empty() {
            log::error!("No Vulkan-capable GPU found");
            return Err(BackendError::NoSuitableDevice);
        }

        let candidates = devices
            .iter()
            .map(|&device| Self::describe_device(instance, surface_loader, surface, device))
            .collect::<BackendResult<Vec<_>>>()?;

        for candidate in &candidates {
            log::debug!(
                "GPU candidate: {} ({} queue families)",
                candidate.name,
                candidate.queue_families.len()
            );
        }

        let requirements = DeviceRequirements {
            extensions: if surface.is_some() {
                vec![ash::khr::swapchain::NAME]
            } else {
                vec![]
            },
            presentation: surface.is_some(),
        };

        let (index, queue_families) = select_device(&candidates, &requirements)?;
        let physical_device = devices[index];
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        Ok(PhysicalDeviceChoice {
            physical_device,
            queue_families,
            msaa_samples: max_usable_sample_count(&properties.limits),
        })
    }

    fn describe_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: Option<vk::SurfaceKHR>,
        device: vk::PhysicalDevice,
    ) -> BackendResult<DeviceCandidate> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut queue_families = Vec::with_capacity(families.len());
        for (index, family) in families.iter().enumerate() {
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = match surface {
                Some(surface) => unsafe {
                    surface_loader.get_physical_device_surface_support(
                        device,
                        index as u32,
                        surface,
                    )?
                },
                // Headless: nothing to present, reuse the graphics family
                None => graphics,
            };
            queue_families.push(QueueFamilySupport { graphics, present });
        }

        let extensions = unsafe { instance.enumerate_device_extension_properties(device)? }
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();

        let (surface_format_count, present_mode_count) = match surface {
            Some(surface) => unsafe {
                (
                    surface_loader
                        .get_physical_device_surface_formats(device, surface)
                        .map(|formats| formats.len())
                        .unwrap_or(0),
                    surface_loader
                        .get_physical_device_surface_present_modes(device, surface)
                        .map(|modes| modes.len())
                        .unwrap_or(0),
                )
            },
            None => (0, 0),
        };

        Ok(DeviceCandidate {
            name: properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            queue_families,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            extensions,
            surface_format_count,
            present_mode_count,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilyIndices,
        presentation: bool,
        sample_rate_shading: bool,
    ) -> BackendResult<ash::Device> {
        // One queue per distinct family
        let unique_families: BTreeSet<u32> =
            [queue_families.graphics, queue_families.present].into_iter().collect();

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions = if presentation {
            vec![ash::khr::swapchain::NAME.as_ptr()]
        } else {
            vec![]
        };

        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .sample_rate_shading(sample_rate_shading);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None)? };

        Ok(device)
    }

    /// Presentation surface; fails on headless devices
    pub fn surface(&self) -> BackendResult<vk::SurfaceKHR> {
        self.surface.ok_or(BackendError::Headless)
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// First candidate format whose features cover `features` for `tiling`
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        candidates.iter().copied().find(|&format| {
            let props = self.format_properties(format);
            match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                _ => false,
            }
        })
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                self.surface_loader.destroy_surface(surface, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
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
        .pfn_user_callback(Some(debug_callback))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[Vulkan] {}", message),
        _ => log::debug!("[Vulkan] {}", message),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messenger_forwards_every_logged_severity() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

        let info = debug_messenger_info();
        for severity in [Severity::VERBOSE, Severity::INFO, Severity::WARNING, Severity::ERROR] {
            assert!(info.message_severity.contains(severity), "{:?} is filtered out", severity);
        }
    }

    fn family(graphics: bool, present: bool) -> QueueFamilySupport {
        QueueFamilySupport { graphics, present }
    }

    fn capable_candidate(name: &str) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_string(),
            queue_families: vec![family(true, true)],
            sampler_anisotropy: true,
            extensions: vec![ash::khr::swapchain::NAME.to_owned()],
            surface_format_count: 2,
            present_mode_count: 1,
        }
    }

    fn presenting() -> DeviceRequirements {
        DeviceRequirements {
            extensions: vec![ash::khr::swapchain::NAME],
            presentation: true,
        }
    }

    #[test]
    fn queue_families_may_be_distinct() {
        let families = [family(true, false), family(false, true)];
        assert_eq!(
            find_queue_families(&families),
            Some(QueueFamilyIndices { graphics: 0, present: 1 })
        );
    }

    #[test]
    fn queue_family_scan_stops_once_both_resolve() {
        let families = [family(true, false), family(true, true), family(true, true)];
        let indices = find_queue_families(&families).unwrap();
        assert_eq!(indices, QueueFamilyIndices { graphics: 1, present: 1 });
        assert!(indices.is_shared());
    }

    #[test]
    fn unresolvable_present_family_rejects() {
        assert_eq!(find_queue_families(&[family(true, false)]), None);
        assert_eq!(find_queue_families(&[]), None);
    }

    #[test]
    fn first_suitable_device_wins() {
        let mut no_aniso = capable_candidate("no-aniso");
        no_aniso.sampler_anisotropy = false;
        let candidates = [no_aniso, capable_candidate("a"), capable_candidate("b")];

        let (index, _) = select_device(&candidates, &presenting()).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn each_requirement_can_reject() {
        let mut no_graphics = capable_candidate("no-graphics");
        no_graphics.queue_families = vec![family(false, true)];

        let mut no_present = capable_candidate("no-present");
        no_present.queue_families = vec![family(true, false)];

        let mut no_swapchain = capable_candidate("no-swapchain");
        no_swapchain.extensions.clear();

        let mut no_formats = capable_candidate("no-formats");
        no_formats.surface_format_count = 0;

        let mut no_modes = capable_candidate("no-modes");
        no_modes.present_mode_count = 0;

        for candidate in [no_graphics, no_present, no_swapchain, no_formats, no_modes] {
            let result = select_device(std::slice::from_ref(&candidate), &presenting());
            assert!(
                matches!(result, Err(BackendError::NoSuitableDevice)),
                "{} should be rejected",
                candidate.name
            );
        }
    }

    #[test]
    fn headless_requirements_skip_surface_checks() {
        let mut candidate = capable_candidate("headless");
        candidate.extensions.clear();
        candidate.surface_format_count = 0;
        candidate.present_mode_count = 0;

        let (index, families) =
            select_device(&[candidate], &DeviceRequirements::default()).unwrap();
        assert_eq!(index, 0);
        assert!(families.is_shared());
    }

    #[test]
    fn sample_count_is_common_maximum() {
        let limits = vk::PhysicalDeviceLimits {
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4,
            ..Default::default()
        };
        assert_eq!(max_usable_sample_count(&limits), vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn sample_count_defaults_to_one() {
        let limits = vk::PhysicalDeviceLimits::default();
        assert_eq!(max_usable_sample_count(&limits), vk::SampleCountFlags::TYPE_1);

        let all = vk::SampleCountFlags::from_raw(0x7f);
        let limits = vk::PhysicalDeviceLimits {
            framebuffer_color_sample_counts: all,
            framebuffer_depth_sample_counts: all,
            ..Default::default()
        };
        assert_eq!(max_usable_sample_count(&limits), vk::SampleCountFlags::TYPE_64);
    }

    #[test]
    fn layer_check_uses_exact_names() {
        let available = [c"VK_LAYER_KHRONOS_validation_extra", c"VK_LAYER_MESA_overlay"];
        assert_eq!(missing_layer(&[VALIDATION_LAYER], &available), Some(VALIDATION_LAYER));

        let available = [c"VK_LAYER_MESA_overlay", VALIDATION_LAYER];
        assert_eq!(missing_layer(&[VALIDATION_LAYER], &available), None);
    }
}

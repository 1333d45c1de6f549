// Presentation surface
//
// Binds the instance to a native window handed over by the windowing shell.
// The platform is picked from the raw handle variant, not from cfg flags, so
// one binary serves X11 and Wayland alike.

use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

use crate::error::{RenderError, Result, VkResultExt};

/// Instance extensions needed to present to windows of this display type.
pub fn required_instance_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => {
            return Err(RenderError::UnsupportedWindow(format!("{:?}", other)));
        }
    };

    Ok(vec![khr::Surface::name(), platform])
}

/// What the surface offers a given physical device.
#[derive(Clone, Debug)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// At least one format and one present mode.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Owned `VkSurfaceKHR`, destroyed on drop.
pub struct Surface {
    loader: khr::Surface,
    handle: vk::SurfaceKHR,
}

impl Surface {
    pub fn create(
        entry: &Entry,
        instance: &ash::Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let handle = unsafe { create_platform_surface(entry, instance, display, window)? };
        log::debug!("Created presentation surface");

        Ok(Self {
            loader: khr::Surface::new(entry, instance),
            handle,
        })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> Result<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.handle)
        }
        .during("Query surface present support")
    }

    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.handle)
                    .during("Query surface capabilities")?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.handle)
                    .during("Query surface formats")?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.handle)
                    .during("Query surface present modes")?,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if self.handle != vk::SurfaceKHR::null() {
            unsafe { self.loader.destroy_surface(self.handle, None) };
            self.handle = vk::SurfaceKHR::null();
        }
    }
}

unsafe fn create_platform_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(entry, instance)
                .create_win32_surface(&create_info, None)
                .during("Create Win32 surface")
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .ok_or_else(|| RenderError::UnsupportedWindow("Xlib handle without display".into()))?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut vk::Display)
                .window(handle.window);
            khr::XlibSurface::new(entry, instance)
                .create_xlib_surface(&create_info, None)
                .during("Create Xlib surface")
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display
                .connection
                .ok_or_else(|| RenderError::UnsupportedWindow("XCB handle without connection".into()))?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr())
                .window(handle.window.get());
            khr::XcbSurface::new(entry, instance)
                .create_xcb_surface(&create_info, None)
                .during("Create XCB surface")
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            khr::WaylandSurface::new(entry, instance)
                .create_wayland_surface(&create_info, None)
                .during("Create Wayland surface")
        }
        (display, window) => Err(RenderError::UnsupportedWindow(format!(
            "{:?} / {:?}",
            display, window
        ))),
    }
}

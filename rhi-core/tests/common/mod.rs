use std::sync::Arc;

use hal::{
    api::Soft,
    soft::{self, ExecutionMode},
    Format, HeapKind, ResourceDescriptor, ResourceDimension, ResourceStates, ShaderStage,
};
use rhi_core::{
    pipeline::{Shader, ShaderRegisterCounts},
    resource::Resource,
    Device, Settings,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn device(mode: ExecutionMode, settings: Settings) -> Arc<Device<Soft>> {
    init_logger();
    Device::new(soft::Device::new(mode), settings).unwrap()
}

pub fn shader(stage: ShaderStage, srv: u8, cbv: u8, uav: u8, sampler: u8) -> Arc<Shader> {
    Arc::new(Shader::new(
        stage,
        vec![0xDC, 0xBC, stage as u8],
        ShaderRegisterCounts {
            srv,
            cbv,
            uav,
            sampler,
        },
    ))
}

pub fn texture(
    device: &Device<Soft>,
    format: Format,
    width: u64,
    height: u32,
    mips: u16,
) -> Arc<Resource<Soft>> {
    device
        .create_resource(&ResourceDescriptor {
            label: Some("texture"),
            dimension: ResourceDimension::Texture2D,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels: mips,
            format,
            heap: HeapKind::Default,
            initial_state: ResourceStates::COMMON,
        })
        .unwrap()
}

pub fn buffer(device: &Device<Soft>, label: &str, size: u64) -> Arc<Resource<Soft>> {
    device
        .create_resource(&ResourceDescriptor::buffer(Some(label), size, HeapKind::Default))
        .unwrap()
}

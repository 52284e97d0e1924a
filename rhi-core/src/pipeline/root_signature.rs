use std::{fmt, sync::Arc};

use arrayvec::ArrayVec;
use hal::{
    DescriptorRangeType, Device as _, RootParameter, ShaderStage, ShaderVisibility, MAX_CBS,
    MAX_ROOT_COST, MAX_SAMPLERS, MAX_SRVS, MAX_UAVS,
};
use parking_lot::Mutex;

use super::{CreateRootSignatureError, HitMiss};
use crate::{hal_api::HalApi, resource_log, FastHashMap};

const VISIBILITIES: [ShaderVisibility; ShaderVisibility::COUNT] = [
    ShaderVisibility::All,
    ShaderVisibility::Vertex,
    ShaderVisibility::Hull,
    ShaderVisibility::Domain,
    ShaderVisibility::Geometry,
    ShaderVisibility::Pixel,
];

const RANGE_TYPES: [DescriptorRangeType; 4] = [
    DescriptorRangeType::Srv,
    DescriptorRangeType::Cbv,
    DescriptorRangeType::Uav,
    DescriptorRangeType::Sampler,
];

fn range_index(ty: DescriptorRangeType) -> usize {
    match ty {
        DescriptorRangeType::Srv => 0,
        DescriptorRangeType::Cbv => 1,
        DescriptorRangeType::Uav => 2,
        DescriptorRangeType::Sampler => 3,
    }
}

/// Number of registers of each kind a shader reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ShaderRegisterCounts {
    pub srv: u8,
    pub cbv: u8,
    pub uav: u8,
    pub sampler: u8,
}

impl ShaderRegisterCounts {
    pub fn count(&self, ty: DescriptorRangeType) -> u32 {
        u32::from(match ty {
            DescriptorRangeType::Srv => self.srv,
            DescriptorRangeType::Cbv => self.cbv,
            DescriptorRangeType::Uav => self.uav,
            DescriptorRangeType::Sampler => self.sampler,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Rounds every count up to a power of two, clamped to the slot limits.
    pub fn quantized(self) -> Self {
        fn quantize(count: u8, limit: usize) -> u8 {
            match count {
                0 => 0,
                n => n.checked_next_power_of_two().map_or(limit, usize::from).min(limit) as u8,
            }
        }
        Self {
            srv: quantize(self.srv, MAX_SRVS),
            cbv: quantize(self.cbv, MAX_CBS),
            uav: quantize(self.uav, MAX_UAVS),
            sampler: quantize(self.sampler, MAX_SAMPLERS),
        }
    }

    /// Component-wise maximum.
    pub fn max(self, other: Self) -> Self {
        Self {
            srv: self.srv.max(other.srv),
            cbv: self.cbv.max(other.cbv),
            uav: self.uav.max(other.uav),
            sampler: self.sampler.max(other.sampler),
        }
    }
}

/// The shape of a root signature: quantized register counts per shader
/// visibility. Pipelines with equal shapes share a root signature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct QuantizedBoundShaderState {
    pub counts: [ShaderRegisterCounts; ShaderVisibility::COUNT],
    pub allow_input_assembler: bool,
}

impl QuantizedBoundShaderState {
    pub fn graphics<I>(stages: I, allow_input_assembler: bool) -> Self
    where
        I: IntoIterator<Item = (ShaderStage, ShaderRegisterCounts)>,
    {
        let mut shape = Self {
            allow_input_assembler,
            ..Self::default()
        };
        for (stage, counts) in stages {
            let slot = &mut shape.counts[stage.visibility().index()];
            *slot = slot.max(counts.quantized());
        }
        shape
    }

    /// Compute shaders bind everything with the all-stages visibility.
    pub fn compute(counts: ShaderRegisterCounts) -> Self {
        let mut shape = Self::default();
        shape.counts[ShaderVisibility::All.index()] = counts.quantized();
        shape
    }

    fn root_parameters(&self) -> ArrayVec<RootParameter, { ShaderVisibility::COUNT * 4 }> {
        let mut parameters = ArrayVec::new();
        for visibility in VISIBILITIES {
            let counts = &self.counts[visibility.index()];
            for range_type in RANGE_TYPES {
                let count = counts.count(range_type);
                if count != 0 {
                    parameters.push(RootParameter {
                        visibility,
                        range_type,
                        count,
                        base_register: 0,
                    });
                }
            }
        }
        parameters
    }
}

/// A root signature and where each of its descriptor tables is bound.
pub struct RootSignature<A: HalApi> {
    raw: A::RootSignature,
    shape: QuantizedBoundShaderState,
    /// Root parameter index per visibility and range type.
    tables: [[Option<u8>; 4]; ShaderVisibility::COUNT],
    table_count: u32,
}

impl<A: HalApi> RootSignature<A> {
    pub fn raw(&self) -> &A::RootSignature {
        &self.raw
    }

    pub fn shape(&self) -> &QuantizedBoundShaderState {
        &self.shape
    }

    pub fn table_count(&self) -> u32 {
        self.table_count
    }

    /// Root parameter index of the `ty` table read by `stage`.
    pub fn table_slot(&self, stage: ShaderStage, ty: DescriptorRangeType) -> Option<u32> {
        self.tables[stage.visibility().index()][range_index(ty)].map(u32::from)
    }

    /// Number of descriptors in the `ty` table read by `stage`.
    pub fn table_size(&self, stage: ShaderStage, ty: DescriptorRangeType) -> u32 {
        self.shape.counts[stage.visibility().index()].count(ty)
    }
}

impl<A: HalApi> fmt::Debug for RootSignature<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootSignature")
            .field("shape", &self.shape)
            .field("table_count", &self.table_count)
            .finish()
    }
}

/// Root signatures by shape. Never evicts.
pub struct RootSignatureCache<A: HalApi> {
    map: Mutex<FastHashMap<QuantizedBoundShaderState, Arc<RootSignature<A>>>>,
    counts: HitMiss,
}

impl<A: HalApi> RootSignatureCache<A> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(FastHashMap::default()),
            counts: HitMiss::default(),
        }
    }

    pub fn get_root_signature(
        &self,
        device: &A::Device,
        shape: &QuantizedBoundShaderState,
    ) -> Result<Arc<RootSignature<A>>, CreateRootSignatureError> {
        let mut map = self.map.lock();
        let found = map.get(shape).cloned();
        self.counts.record(found.is_some());
        if let Some(root_signature) = found {
            return Ok(root_signature);
        }

        let parameters = shape.root_parameters();
        let cost = parameters.len() as u32 * RootParameter::COST;
        if cost > MAX_ROOT_COST {
            return Err(CreateRootSignatureError::TooLarge {
                cost,
                limit: MAX_ROOT_COST,
            });
        }
        let raw = device.create_root_signature(&hal::RootSignatureDescriptor {
            label: None,
            parameters: &parameters,
            allow_input_assembler: shape.allow_input_assembler,
        })?;

        let mut tables = [[None; 4]; ShaderVisibility::COUNT];
        for (index, parameter) in parameters.iter().enumerate() {
            tables[parameter.visibility.index()][range_index(parameter.range_type)] =
                Some(index as u8);
        }
        resource_log!("Created root signature with {} tables", parameters.len());
        let root_signature = Arc::new(RootSignature {
            raw,
            shape: *shape,
            tables,
            table_count: parameters.len() as u32,
        });
        map.insert(*shape, Arc::clone(&root_signature));
        Ok(root_signature)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn hit_miss_counts(&self) -> (u64, u64) {
        self.counts.get()
    }
}

impl<A: HalApi> Default for RootSignatureCache<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: HalApi> fmt::Debug for RootSignatureCache<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootSignatureCache")
            .field("len", &self.len())
            .field("hit_miss", &self.hit_miss_counts())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hal::{
        api::Soft,
        soft::{self, ExecutionMode},
    };

    fn counts(srv: u8, cbv: u8, uav: u8, sampler: u8) -> ShaderRegisterCounts {
        ShaderRegisterCounts {
            srv,
            cbv,
            uav,
            sampler,
        }
    }

    #[test]
    fn counts_round_up_to_powers_of_two() {
        assert_eq!(counts(0, 1, 3, 5).quantized(), counts(0, 1, 4, 8));
        assert_eq!(counts(65, 17, 9, 200).quantized(), counts(64, 16, 8, 16));
    }

    #[test]
    fn equal_shapes_share_a_root_signature() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let cache = RootSignatureCache::<Soft>::new();
        let a = QuantizedBoundShaderState::graphics(
            [
                (ShaderStage::Vertex, counts(1, 1, 0, 0)),
                (ShaderStage::Pixel, counts(3, 1, 0, 2)),
            ],
            true,
        );
        let b = QuantizedBoundShaderState::graphics(
            [
                (ShaderStage::Vertex, counts(1, 1, 0, 0)),
                (ShaderStage::Pixel, counts(4, 1, 0, 2)),
            ],
            true,
        );
        assert_eq!(a, b);

        let first = cache.get_root_signature(&device, &a).unwrap();
        let second = cache.get_root_signature(&device, &b).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.hit_miss_counts(), (1, 1));
        assert_eq!(device.stats().root_signatures, 1);

        assert_eq!(first.table_count(), 5);
        assert_eq!(first.table_slot(ShaderStage::Vertex, DescriptorRangeType::Srv), Some(0));
        assert_eq!(first.table_slot(ShaderStage::Pixel, DescriptorRangeType::Sampler), Some(4));
        assert_eq!(first.table_slot(ShaderStage::Pixel, DescriptorRangeType::Uav), None);
        assert_eq!(first.table_size(ShaderStage::Pixel, DescriptorRangeType::Srv), 4);
    }

    #[test]
    fn compute_uses_all_stages_visibility() {
        let device = soft::Device::new(ExecutionMode::Immediate);
        let cache = RootSignatureCache::<Soft>::new();
        let shape = QuantizedBoundShaderState::compute(counts(2, 1, 1, 0));
        let root_signature = cache.get_root_signature(&device, &shape).unwrap();
        assert_eq!(root_signature.table_count(), 3);
        assert_eq!(
            root_signature.table_slot(ShaderStage::Compute, DescriptorRangeType::Uav),
            Some(2)
        );
        assert!(!root_signature.shape().allow_input_assembler);
    }
}

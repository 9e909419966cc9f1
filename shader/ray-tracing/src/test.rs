use glam::{Affine3A, Vec3};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::*;

const MISS_VALUE: u32 = 7;

fn stage_shader(name: &str, stage: ShaderStage, body: impl FnOnce(&mut ShaderBuilder)) -> Shader {
  let mut b = ShaderBuilder::new(name, stage);
  body(&mut b);
  b.finish()
}

fn launch_index(b: &mut ShaderBuilder) -> Node {
  let id = b.intrinsic(Intrinsic::LaunchId, &[]);
  b.extract(id, 0)
}

fn lane_address(b: &mut ShaderBuilder, base: u64, index: Node, stride: u32) -> Node {
  let base = b.imm_u64(base);
  let offset = b.imul_imm(index, stride);
  b.address_offset(base, offset)
}

fn store_payload(b: &mut ShaderBuilder, offset: u32, value: Node) {
  b.intrinsic_void(Intrinsic::StorePayload { offset }, &[value]);
}

fn load_payload(b: &mut ShaderBuilder, offset: u32) -> Node {
  b.intrinsic(
    Intrinsic::LoadPayload {
      ty: ValueType::U32,
      offset,
    },
    &[],
  )
}

fn payload_writer(name: &str, stage: ShaderStage, value: u32) -> Shader {
  stage_shader(name, stage, |b| {
    let value = b.imm_u32(value);
    store_payload(b, 0, value);
  })
}

struct Ray {
  origin: Node,
  direction: Node,
  tmax: f32,
}

fn trace_ray(
  b: &mut ShaderBuilder,
  accel: u64,
  ray_flags: u32,
  miss_index: u32,
  ray: Ray,
  payload: Node,
) {
  let srcs = [
    b.imm_u64(accel),
    b.imm_u32(ray_flags),
    b.imm_u32(0xff),
    b.imm_u32(0),
    b.imm_u32(1),
    b.imm_u32(miss_index),
    ray.origin,
    b.imm_f32(0.),
    ray.direction,
    b.imm_f32(ray.tmax),
    payload,
  ];
  b.intrinsic_void(
    Intrinsic::TraceRay {
      call_idx: 0,
      stack_size: 0,
    },
    &srcs,
  );
}

/// how the ray generation program picks the ray of each lane
enum RaySource {
  /// down -z from `(x_start + lane, 0.25, 1)`
  Row { x_start: f32 },
  /// origin and direction at `buffer + lane * 32`
  Buffer(u64),
}

struct RayGenDesc {
  accel: u64,
  output: u64,
  rays: RaySource,
  ray_flags: u32,
  payload_words: u32,
}

/// Traces one ray per lane and copies the zero initialized payload words to the output.
fn trace_raygen(desc: &RayGenDesc) -> Shader {
  let mut b = ShaderBuilder::new("raygen", ShaderStage::RayGen);
  b.shader_mut().scratch_size = 16;
  let lane = launch_index(&mut b);
  let offsets: Vec<Node> = (0..desc.payload_words).map(|i| b.imm_u32(4 * i)).collect();
  let zero = b.imm_u32(0);
  for offset in &offsets {
    b.intrinsic_void(
      Intrinsic::StoreScratch {
        base: ScratchBase::Frame,
      },
      &[zero, *offset],
    );
  }

  let (origin, direction) = match desc.rays {
    RaySource::Row { x_start } => {
      let x = b.alu(AluOp::U2F, &[lane]);
      let start = b.imm_f32(x_start);
      let x = b.fadd(x, start);
      let y = b.imm_f32(0.25);
      let z = b.imm_f32(1.);
      let origin = b.construct(ValueType::Vec3, &[x, y, z]);
      let direction = b.imm(Value::Vec3([0., 0., -1.]));
      (origin, direction)
    }
    RaySource::Buffer(buffer) => {
      let address = lane_address(&mut b, buffer, lane, 32);
      let origin = b.load_global(ValueType::Vec3, address);
      let direction = b.load_global_at(ValueType::Vec3, address, 16);
      (origin, direction)
    }
  };
  let ray = Ray {
    origin,
    direction,
    tmax: 100.,
  };
  trace_ray(&mut b, desc.accel, desc.ray_flags, 0, ray, offsets[0]);

  let out = lane_address(&mut b, desc.output, lane, 4 * desc.payload_words);
  for (i, offset) in offsets.iter().enumerate() {
    let value = b.intrinsic(
      Intrinsic::LoadScratch {
        ty: ValueType::U32,
        base: ScratchBase::Frame,
      },
      &[*offset],
    );
    let slot = b.iadd_imm64(out, 4 * i as u64);
    b.intrinsic_void(Intrinsic::StoreGlobal, &[value, slot]);
  }
  b.finish()
}

/// groups placed into the shader binding table, one ray type
#[derive(Default)]
struct SbtLayout {
  raygen: u32,
  miss: Vec<u32>,
  hit: Vec<u32>,
  callable: Vec<u32>,
}

struct Dispatched {
  memory: GlobalMemory,
  trace: Vec<DispatchTraceEntry>,
  stats: DispatchStats,
  stack_size: u32,
}

impl Dispatched {
  fn words(&self, address: u64, count: usize) -> Vec<u32> {
    (0..count as u64)
      .map(|i| self.memory.read_u32(address + 4 * i).unwrap())
      .collect()
  }

  fn launch_names(&self) -> Vec<&str> {
    self.trace.iter().map(|e| e.name.as_str()).collect()
  }

  fn assert_stack_in_bounds(&self) {
    for entry in &self.trace {
      for sp in entry.stack_ptrs.iter().flatten() {
        assert!(
          *sp <= self.stack_size,
          "{}: stack pointer {sp} above {}",
          entry.name,
          self.stack_size
        );
      }
    }
  }
}

fn dispatch(
  desc: &RayTracingPipelineDescriptor,
  config: RtLoweringConfig,
  mode: ExecutionMode,
  memory: GlobalMemory,
  layout: &SbtLayout,
  launch: u32,
) -> Dispatched {
  let compiled = RayTracingPipelineCompiler::new(config)
    .compile(desc, mode)
    .unwrap();
  let mut emulator = DispatchEmulator::new(&compiled, memory, EmulatorConfig::default()).unwrap();

  let record = |group: u32| ShaderRecord::new(emulator.group_handle(group).unwrap());
  let mut sbt = ShaderBindingTableBuilder::new(1);
  sbt.config_ray_generation(record(layout.raygen));
  for (i, group) in layout.miss.iter().enumerate() {
    sbt.config_missing(i as u32, record(*group));
  }
  for (i, group) in layout.hit.iter().enumerate() {
    sbt.config_hit_group(i as u32, 0, record(*group));
  }
  for (i, group) in layout.callable.iter().enumerate() {
    sbt.config_callable(i as u32, record(*group));
  }

  let stats = emulator.dispatch(&sbt, [launch, 1, 1]).unwrap();
  let trace = emulator.trace().to_vec();
  Dispatched {
    memory: emulator.into_memory(),
    trace,
    stats,
    stack_size: compiled.stack_size,
  }
}

/// covers `-3.75 < x < 3.75` at `y = 0.25`, front facing for rays down -z
fn wide_triangle(z: f32, primitive_id: u32) -> TriangleDesc {
  TriangleDesc::new(
    [
      Vec3::new(-10., -1., z),
      Vec3::new(10., -1., z),
      Vec3::new(0., 1., z),
    ],
    primitive_id,
  )
}

/// one triangle, a miss writing [`MISS_VALUE`] and a closest hit writing `100 + primitive id`
struct TriangleScene {
  desc: RayTracingPipelineDescriptor,
  layout: SbtLayout,
  memory: GlobalMemory,
  output: u64,
}

fn triangle_scene(lanes: u32, ray_flags: u32) -> TriangleScene {
  triangle_scene_with(lanes, |accel, output| {
    trace_raygen(&RayGenDesc {
      accel,
      output,
      rays: RaySource::Row { x_start: -8. },
      ray_flags,
      payload_words: 1,
    })
  })
}

/// the triangle scene with a custom ray generation program built from the acceleration
/// structure and output addresses
fn triangle_scene_with(
  lanes: u32,
  build_raygen: impl FnOnce(u64, u64) -> Shader,
) -> TriangleScene {
  let mut memory = GlobalMemory::default();
  let accel = AccelerationStructureWriter::write(
    &BvhNodeDesc::Triangle(wide_triangle(0., 3)),
    &mut memory,
  );
  let output = memory.allocate_zeroed(4 * lanes as usize, 16);

  let mut desc = RayTracingPipelineDescriptor::default();
  let raygen = desc.register_general(build_raygen(accel.address, output));
  let miss = desc.register_general(payload_writer("miss", ShaderStage::Miss, MISS_VALUE));
  let chit = desc.register_stage(stage_shader("chit", ShaderStage::ClosestHit, |b| {
    let primitive = b.intrinsic(Intrinsic::PrimitiveId, &[]);
    let value = b.iadd_imm(primitive, 100);
    store_payload(b, 0, value);
  }));
  let hit = desc.register_group(ShaderGroup::TrianglesHitGroup {
    closest_hit: Some(chit),
    any_hit: None,
  });

  TriangleScene {
    desc,
    layout: SbtLayout {
      raygen,
      miss: vec![miss],
      hit: vec![hit],
      ..Default::default()
    },
    memory,
    output,
  }
}

fn expected_row_hits(lanes: u32, hit: u32, miss: u32) -> Vec<u32> {
  // lane x positions are lane - 8, the triangle spans |x| < 3.75
  (0..lanes)
    .map(|lane| if (5..=11).contains(&lane) { hit } else { miss })
    .collect()
}

#[test]
fn indirect_hit_and_miss_follow_the_scheduler() {
  let scene = triangle_scene(16, 0);
  let result = dispatch(
    &scene.desc,
    RtLoweringConfig::default(),
    ExecutionMode::Indirect,
    scene.memory,
    &scene.layout,
    16,
  );

  assert_eq!(result.words(scene.output, 16), expected_row_hits(16, 103, MISS_VALUE));
  assert_eq!(
    result.launch_names(),
    vec!["raygen", "traversal", "miss", "chit", "raygen.resume1"]
  );
  assert_eq!(result.stats.waves, 1);
  assert_eq!(result.stats.launches, 5);
}

#[test]
fn monolithic_matches_indirect() {
  for ray_flags in [0, TraverseFlags::SKIP_CLOSEST_HIT_SHADER.bits()] {
    let mut outputs = Vec::new();
    for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
      let scene = triangle_scene(20, ray_flags);
      let result = dispatch(
        &scene.desc,
        RtLoweringConfig::default().with_wave_size(8),
        mode,
        scene.memory,
        &scene.layout,
        20,
      );
      if mode == ExecutionMode::Monolithic {
        assert_eq!(result.stats.waves, 3);
        assert_eq!(result.stats.launches, 3);
      }
      outputs.push(result.words(scene.output, 20));
    }
    let hit = if ray_flags == 0 { 103 } else { 0 };
    assert_eq!(outputs[0], expected_row_hits(20, hit, MISS_VALUE));
    assert_eq!(outputs[0], outputs[1]);
  }
}

#[test]
fn call_and_return_leave_the_stack_balanced() {
  let scene = triangle_scene(16, 0);
  let result = dispatch(
    &scene.desc,
    RtLoweringConfig::default(),
    ExecutionMode::Indirect,
    scene.memory,
    &scene.layout,
    16,
  );

  let last = result.trace.last().unwrap();
  assert_eq!(last.name, "raygen.resume1");
  assert_eq!(last.active, 0xffff);
  for lane in 0..16 {
    assert_eq!(last.stack_ptrs[lane], Some(0));
  }
  // the traversal runs right above the suspended ray generation frame
  let traversal = &result.trace[1];
  let frame = traversal.stack_ptrs[0].unwrap();
  assert!(frame > 0);
  assert!(traversal.stack_ptrs[..16].iter().all(|sp| *sp == Some(frame)));
  result.assert_stack_in_bounds();
}

#[test]
fn recursive_trace_from_closest_hit() {
  let lanes = 16;
  let mut memory = GlobalMemory::default();
  let accel = AccelerationStructureWriter::write(
    &BvhNodeDesc::Triangle(wide_triangle(0., 0)),
    &mut memory,
  );
  let output = memory.allocate_zeroed(4 * lanes, 16);

  let mut desc = RayTracingPipelineDescriptor::default().with_max_recursion_depth(2);
  let raygen = desc.register_general(trace_raygen(&RayGenDesc {
    accel: accel.address,
    output,
    rays: RaySource::Row { x_start: -8. },
    ray_flags: 0,
    payload_words: 1,
  }));
  let miss = desc.register_general(payload_writer("miss", ShaderStage::Miss, MISS_VALUE));
  let secondary_miss =
    desc.register_general(payload_writer("miss_secondary", ShaderStage::Miss, 5));
  let chit = desc.register_stage(stage_shader("chit", ShaderStage::ClosestHit, |b| {
    b.shader_mut().scratch_size = 16;
    let own_payload = b.imm_u32(0);
    let ray = Ray {
      origin: b.intrinsic(Intrinsic::RayWorldOrigin, &[]),
      direction: b.intrinsic(Intrinsic::RayWorldDirection, &[]),
      // stops short of the triangle
      tmax: 0.5,
    };
    trace_ray(b, accel.address, 0, 1, ray, own_payload);
    let secondary = b.intrinsic(
      Intrinsic::LoadScratch {
        ty: ValueType::U32,
        base: ScratchBase::Frame,
      },
      &[own_payload],
    );
    let value = b.iadd_imm(secondary, 200);
    store_payload(b, 0, value);
  }));
  let hit = desc.register_group(ShaderGroup::TrianglesHitGroup {
    closest_hit: Some(chit),
    any_hit: None,
  });

  let layout = SbtLayout {
    raygen,
    miss: vec![miss, secondary_miss],
    hit: vec![hit],
    ..Default::default()
  };
  let result = dispatch(
    &desc,
    RtLoweringConfig::default(),
    ExecutionMode::Indirect,
    memory,
    &layout,
    lanes as u32,
  );

  assert_eq!(
    result.words(output, lanes),
    expected_row_hits(lanes as u32, 205, MISS_VALUE)
  );
  assert_eq!(
    result.launch_names(),
    vec![
      "raygen",
      "traversal",
      "miss",
      "chit",
      "traversal",
      "miss_secondary",
      "chit.resume2",
      "raygen.resume1",
    ]
  );
  let last = result.trace.last().unwrap();
  assert!(last.stack_ptrs[..lanes].iter().all(|sp| *sp == Some(0)));
  result.assert_stack_in_bounds();
}

#[test]
fn nested_callables_restore_the_caller_payload() {
  let mut memory = GlobalMemory::default();
  let output = memory.allocate_zeroed(4 * 4, 16);

  let mut desc = RayTracingPipelineDescriptor::default();
  let raygen = desc.register_general(stage_shader("raygen", ShaderStage::RayGen, |b| {
    b.shader_mut().scratch_size = 16;
    let lane = launch_index(b);
    let payload = b.imm_u32(0);
    let index = b.imm_u32(0);
    b.intrinsic_void(
      Intrinsic::ExecuteCallable {
        call_idx: 0,
        stack_size: 0,
      },
      &[index, payload],
    );
    let value = b.intrinsic(
      Intrinsic::LoadScratch {
        ty: ValueType::U32,
        base: ScratchBase::Frame,
      },
      &[payload],
    );
    let value = b.iadd(value, lane);
    let address = lane_address(b, output, lane, 4);
    b.intrinsic_void(Intrinsic::StoreGlobal, &[value, address]);
  }));
  let outer = desc.register_general(stage_shader("callable_a", ShaderStage::Callable, |b| {
    b.shader_mut().scratch_size = 16;
    let own_payload = b.imm_u32(0);
    let index = b.imm_u32(1);
    b.intrinsic_void(
      Intrinsic::ExecuteCallable {
        call_idx: 0,
        stack_size: 0,
      },
      &[index, own_payload],
    );
    let inner = b.intrinsic(
      Intrinsic::LoadScratch {
        ty: ValueType::U32,
        base: ScratchBase::Frame,
      },
      &[own_payload],
    );
    let value = b.iadd_imm(inner, 1);
    store_payload(b, 0, value);
  }));
  let inner = desc.register_general(payload_writer("callable_b", ShaderStage::Callable, 41));
  let miss = desc.register_general(payload_writer("miss", ShaderStage::Miss, MISS_VALUE));

  let layout = SbtLayout {
    raygen,
    miss: vec![miss],
    callable: vec![outer, inner],
    ..Default::default()
  };
  let result = dispatch(
    &desc,
    RtLoweringConfig::default(),
    ExecutionMode::Indirect,
    memory,
    &layout,
    4,
  );

  assert_eq!(result.words(output, 4), vec![42, 43, 44, 45]);
  assert_eq!(
    result.launch_names(),
    vec![
      "raygen",
      "callable_a",
      "callable_b",
      "callable_a.resume2",
      "raygen.resume1",
    ]
  );
  let last = result.trace.last().unwrap();
  assert!(last.stack_ptrs[..4].iter().all(|sp| *sp == Some(0)));
}

#[test]
fn ignored_any_hit_restores_the_previous_attributes() {
  let mut memory = GlobalMemory::default();
  // the tilted far triangle is entered first but hit behind the flat near one
  let far = TriangleDesc::new(
    [
      Vec3::new(-5., -5., -1.),
      Vec3::new(5., -5., -1.),
      Vec3::new(0., 5., 0.8),
    ],
    2,
  )
  .with_geometry(0, false);
  let near = TriangleDesc::new(
    [
      Vec3::new(-5., -5., 0.5),
      Vec3::new(5., -5., 0.5),
      Vec3::new(0., 5., 0.5),
    ],
    1,
  )
  .with_geometry(0, false);
  let root = BvhNodeDesc::Box(vec![BvhNodeDesc::Triangle(far), BvhNodeDesc::Triangle(near)]);
  let accel = AccelerationStructureWriter::write(&root, &mut memory);

  let reference_ray = ReferenceRay::new(Vec3::new(0., 0.25, 1.), Vec3::new(0., 0., -1.), 0., 100.);
  let (closest, _) = ReferenceTraversal::new(&memory)
    .traverse(accel.address, &reference_ray, &mut |hit| {
      if hit.primitive_id == 1 {
        AnyHitBehavior::empty()
      } else {
        AnyHitBehavior::ACCEPT_HIT
      }
    })
    .unwrap();
  let closest = closest.unwrap();
  assert_eq!(closest.primitive_id, 2);

  for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
    let mut memory = memory.clone();
    let output = memory.allocate_zeroed(12, 16);

    let mut desc = RayTracingPipelineDescriptor::default();
    let raygen = desc.register_general(trace_raygen(&RayGenDesc {
      accel: accel.address,
      output,
      rays: RaySource::Row { x_start: 0. },
      ray_flags: 0,
      payload_words: 3,
    }));
    let miss = desc.register_general(payload_writer("miss", ShaderStage::Miss, MISS_VALUE));
    let chit = desc.register_stage(stage_shader("chit", ShaderStage::ClosestHit, |b| {
      let primitive = b.intrinsic(Intrinsic::PrimitiveId, &[]);
      store_payload(b, 0, primitive);
      for slot in 0..2 {
        let value = b.intrinsic(Intrinsic::LoadHitAttrib { slot }, &[]);
        store_payload(b, 4 + 4 * slot, value);
      }
    }));
    let any_hit = desc.register_stage(stage_shader("ahit", ShaderStage::AnyHit, |b| {
      let primitive = b.intrinsic(Intrinsic::PrimitiveId, &[]);
      let near = b.ieq_imm(primitive, 1);
      b.if_by(near, |b| b.intrinsic_void(Intrinsic::IgnoreIntersection, &[]));
    }));
    let hit = desc.register_group(ShaderGroup::TrianglesHitGroup {
      closest_hit: Some(chit),
      any_hit: Some(any_hit),
    });

    let layout = SbtLayout {
      raygen,
      miss: vec![miss],
      hit: vec![hit],
      ..Default::default()
    };
    let result = dispatch(&desc, RtLoweringConfig::default(), mode, memory, &layout, 1);
    let words = result.words(output, 3);
    assert_eq!(words[0], 2, "{mode:?}");
    assert_eq!(f32::from_bits(words[1]), closest.barycentrics[0], "{mode:?}");
    assert_eq!(f32::from_bits(words[2]), closest.barycentrics[1], "{mode:?}");
  }
}

#[test]
fn small_traversal_stack_visits_every_leaf_once() {
  let leaves: Vec<BvhNodeDesc> = (0..32)
    .map(|i| BvhNodeDesc::Triangle(wide_triangle(-0.1 * i as f32, i).with_geometry(0, false)))
    .collect();
  let root = BvhNodeDesc::Box(leaves);

  let mut memory = GlobalMemory::default();
  let accel = AccelerationStructureWriter::write(&root, &mut memory);
  let reference_ray = ReferenceRay::new(Vec3::new(0.5, 0.25, 1.), Vec3::new(0., 0., -1.), 0., 100.);
  let (visited, _) = ReferenceTraversal::new(&memory)
    .visit_leaves(accel.address, &reference_ray)
    .unwrap();
  assert_eq!(visited.len(), 32);

  for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
    let mut memory = memory.clone();
    let output = memory.allocate_zeroed(4 * 3 * 4, 16);

    let mut desc = RayTracingPipelineDescriptor::default();
    let raygen = desc.register_general(trace_raygen(&RayGenDesc {
      accel: accel.address,
      output,
      rays: RaySource::Row { x_start: -1.5 },
      ray_flags: 0,
      payload_words: 3,
    }));
    let miss = desc.register_general(stage_shader("miss", ShaderStage::Miss, |b| {
      let one = b.imm_u32(1);
      store_payload(b, 8, one);
    }));
    let any_hit = desc.register_stage(stage_shader("ahit", ShaderStage::AnyHit, |b| {
      let primitive = b.intrinsic(Intrinsic::PrimitiveId, &[]);
      let one = b.imm_u32(1);
      let bit = b.ishl(one, primitive);
      let mask = load_payload(b, 0);
      let mask = b.ior(mask, bit);
      store_payload(b, 0, mask);
      let count = load_payload(b, 4);
      let count = b.iadd_imm(count, 1);
      store_payload(b, 4, count);
      b.intrinsic_void(Intrinsic::IgnoreIntersection, &[]);
    }));
    let hit = desc.register_group(ShaderGroup::TrianglesHitGroup {
      closest_hit: None,
      any_hit: Some(any_hit),
    });

    let layout = SbtLayout {
      raygen,
      miss: vec![miss],
      hit: vec![hit],
      ..Default::default()
    };
    let config = RtLoweringConfig::default()
      .with_wave_size(4)
      .with_traversal_stack_entries(2);
    let result = dispatch(&desc, config, mode, memory, &layout, 4);
    let words = result.words(output, 12);
    for lane in words.chunks(3) {
      assert_eq!(lane, &[u32::MAX, 32, 1], "{mode:?}");
    }
  }
}

#[test]
fn random_rays_agree_with_reference_traversal() {
  let mut rng = StdRng::seed_from_u64(0x5eed);
  let lanes = 32usize;

  let leaves: Vec<BvhNodeDesc> = (0..24)
    .map(|i| {
      let center = Vec3::new(
        rng.gen_range(-4.0..4.0),
        rng.gen_range(-4.0..4.0),
        rng.gen_range(-4.0..0.0),
      );
      let mut corner = || {
        center
          + Vec3::new(
            rng.gen_range(-1.5..1.5),
            rng.gen_range(-1.5..1.5),
            rng.gen_range(-0.5..0.5),
          )
      };
      BvhNodeDesc::Triangle(TriangleDesc::new([corner(), corner(), corner()], i))
    })
    .collect();

  let mut memory = GlobalMemory::default();
  let accel = AccelerationStructureWriter::write(&BvhNodeDesc::Box(leaves), &mut memory);
  let rays = memory.allocate_zeroed(32 * lanes, 16);
  let mut expected = Vec::new();
  for lane in 0..lanes as u64 {
    let origin = Vec3::new(rng.gen_range(-4.0..4.0), rng.gen_range(-4.0..4.0), 3.);
    let direction = Vec3::new(rng.gen_range(-0.3..0.3), rng.gen_range(-0.3..0.3), -1.).normalize();
    memory
      .write_value(rays + 32 * lane, Value::Vec3(origin.to_array()))
      .unwrap();
    memory
      .write_value(rays + 32 * lane + 16, Value::Vec3(direction.to_array()))
      .unwrap();

    let ray = ReferenceRay::new(origin, direction, 0., 100.);
    let (closest, _) = ReferenceTraversal::new(&memory)
      .traverse(accel.address, &ray, &mut |_| AnyHitBehavior::ACCEPT_HIT)
      .unwrap();
    expected.push(closest.map_or(0, |hit| hit.primitive_id + 1));
  }
  assert!(expected.iter().any(|v| *v == 0));
  assert!(expected.iter().any(|v| *v != 0));

  for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
    let mut memory = memory.clone();
    let output = memory.allocate_zeroed(4 * lanes, 16);

    let mut desc = RayTracingPipelineDescriptor::default();
    let raygen = desc.register_general(trace_raygen(&RayGenDesc {
      accel: accel.address,
      output,
      rays: RaySource::Buffer(rays),
      ray_flags: 0,
      payload_words: 1,
    }));
    let miss = desc.register_general(payload_writer("miss", ShaderStage::Miss, 0));
    let chit = desc.register_stage(stage_shader("chit", ShaderStage::ClosestHit, |b| {
      let primitive = b.intrinsic(Intrinsic::PrimitiveId, &[]);
      let value = b.iadd_imm(primitive, 1);
      store_payload(b, 0, value);
    }));
    let hit = desc.register_group(ShaderGroup::TrianglesHitGroup {
      closest_hit: Some(chit),
      any_hit: None,
    });

    let layout = SbtLayout {
      raygen,
      miss: vec![miss],
      hit: vec![hit],
      ..Default::default()
    };
    let result = dispatch(&desc, RtLoweringConfig::default(), mode, memory, &layout, lanes as u32);
    assert_eq!(result.words(output, lanes), expected, "{mode:?}");
  }
}

#[test]
fn intersection_shader_with_fused_any_hit() {
  for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
    let mut memory = GlobalMemory::default();
    let root = BvhNodeDesc::Box(vec![
      BvhNodeDesc::Aabb(
        AabbDesc::new(Vec3::new(-1., -1., -0.5), Vec3::new(1., 1., 0.5), 0).with_geometry(0, false),
      ),
      BvhNodeDesc::Aabb(
        AabbDesc::new(Vec3::new(-1., -1., -2.), Vec3::new(1., 1., -1.), 1).with_geometry(0, false),
      ),
    ]);
    let accel = AccelerationStructureWriter::write(&root, &mut memory);
    let output = memory.allocate_zeroed(8, 16);

    let mut desc = RayTracingPipelineDescriptor::default();
    let raygen = desc.register_general(trace_raygen(&RayGenDesc {
      accel: accel.address,
      output,
      rays: RaySource::Row { x_start: 0. },
      ray_flags: 0,
      payload_words: 2,
    }));
    let miss = desc.register_general(payload_writer("miss", ShaderStage::Miss, MISS_VALUE));
    let chit = desc.register_stage(stage_shader("chit", ShaderStage::ClosestHit, |b| {
      let primitive = b.intrinsic(Intrinsic::PrimitiveId, &[]);
      let kind = b.intrinsic(Intrinsic::HitKind, &[]);
      let kind = b.imul_imm(kind, 10);
      let value = b.iadd(primitive, kind);
      store_payload(b, 0, value);
      let t = b.intrinsic(Intrinsic::RayTMax, &[]);
      store_payload(b, 4, t);
    }));
    let any_hit = desc.register_stage(stage_shader("ahit", ShaderStage::AnyHit, |b| {
      let kind = b.intrinsic(Intrinsic::HitKind, &[]);
      let first = b.ieq_imm(kind, 3);
      b.if_by(first, |b| b.intrinsic_void(Intrinsic::IgnoreIntersection, &[]));
    }));
    // reports `t = primitive + 1` with hit kind `primitive + 3`
    let intersection = desc.register_stage(stage_shader("isec", ShaderStage::Intersection, |b| {
      let primitive = b.intrinsic(Intrinsic::PrimitiveId, &[]);
      let t = b.alu(AluOp::U2F, &[primitive]);
      let one = b.imm_f32(1.);
      let t = b.fadd(t, one);
      let kind = b.iadd_imm(primitive, 3);
      b.intrinsic(Intrinsic::ReportIntersection, &[t, kind]);
    }));
    let hit = desc.register_group(ShaderGroup::ProceduralHitGroup {
      closest_hit: Some(chit),
      any_hit: Some(any_hit),
      intersection,
    });

    let layout = SbtLayout {
      raygen,
      miss: vec![miss],
      hit: vec![hit],
      ..Default::default()
    };
    let result = dispatch(&desc, RtLoweringConfig::default(), mode, memory, &layout, 1);
    let words = result.words(output, 2);
    assert_eq!(words[0], 41, "{mode:?}");
    assert_eq!(f32::from_bits(words[1]), 2., "{mode:?}");
  }
}

#[test]
fn instances_pick_hit_groups_by_sbt_offset() {
  for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
    let mut memory = GlobalMemory::default();
    let blas = AccelerationStructureWriter::write(
      &BvhNodeDesc::Triangle(TriangleDesc::new(
        [
          Vec3::new(-1., -1., 0.),
          Vec3::new(1., -1., 0.),
          Vec3::new(0., 1., 0.),
        ],
        0,
      )),
      &mut memory,
    );
    let mut left = InstanceDesc::new(blas, Affine3A::from_translation(Vec3::new(-3., 0., 0.)));
    left.custom_index = 7;
    let mut right = InstanceDesc::new(blas, Affine3A::from_translation(Vec3::new(3., 0., 0.)));
    right.custom_index = 9;
    right.sbt_offset = 1;
    let tlas = AccelerationStructureWriter::write(
      &BvhNodeDesc::Box(vec![BvhNodeDesc::Instance(left), BvhNodeDesc::Instance(right)]),
      &mut memory,
    );
    let output = memory.allocate_zeroed(4 * 16, 16);

    let mut desc = RayTracingPipelineDescriptor::default();
    let raygen = desc.register_general(trace_raygen(&RayGenDesc {
      accel: tlas.address,
      output,
      rays: RaySource::Row { x_start: -8. },
      ray_flags: 0,
      payload_words: 1,
    }));
    let miss = desc.register_general(payload_writer("miss", ShaderStage::Miss, 1));
    let mut hit_groups = Vec::new();
    for (name, bias) in [("chit_a", 0), ("chit_b", 500)] {
      let chit = desc.register_stage(stage_shader(name, ShaderStage::ClosestHit, |b| {
        let custom = b.intrinsic(Intrinsic::InstanceCustomIndex, &[]);
        let value = b.iadd_imm(custom, bias);
        store_payload(b, 0, value);
      }));
      hit_groups.push(desc.register_group(ShaderGroup::TrianglesHitGroup {
        closest_hit: Some(chit),
        any_hit: None,
      }));
    }

    let layout = SbtLayout {
      raygen,
      miss: vec![miss],
      hit: hit_groups,
      ..Default::default()
    };
    let result = dispatch(&desc, RtLoweringConfig::default(), mode, memory, &layout, 16);
    let expected: Vec<u32> = (0..16)
      .map(|lane| match lane {
        5 => 7,
        11 => 509,
        _ => 1,
      })
      .collect();
    assert_eq!(result.words(output, 16), expected, "{mode:?}");
  }
}

/// Closest hit stores its hit kind and miss stores the ray's `tmax`, 16 lanes along the row.
fn run_hit_kind_and_tmax_queries(mode: ExecutionMode, null_accel: bool) -> (Dispatched, Vec<u32>) {
  let lanes = 16;
  let mut memory = GlobalMemory::default();
  let accel = AccelerationStructureWriter::write(
    &BvhNodeDesc::Triangle(wide_triangle(0., 3)),
    &mut memory,
  );
  let output = memory.allocate_zeroed(4 * lanes, 16);

  let mut desc = RayTracingPipelineDescriptor::default();
  let raygen = desc.register_general(trace_raygen(&RayGenDesc {
    accel: if null_accel { 0 } else { accel.address },
    output,
    rays: RaySource::Row { x_start: -8. },
    ray_flags: 0,
    payload_words: 1,
  }));
  let miss = desc.register_general(stage_shader("miss", ShaderStage::Miss, |b| {
    let t = b.intrinsic(Intrinsic::RayTMax, &[]);
    store_payload(b, 0, t);
  }));
  let chit = desc.register_stage(stage_shader("chit", ShaderStage::ClosestHit, |b| {
    let kind = b.intrinsic(Intrinsic::HitKind, &[]);
    store_payload(b, 0, kind);
  }));
  let hit = desc.register_group(ShaderGroup::TrianglesHitGroup {
    closest_hit: Some(chit),
    any_hit: None,
  });

  let layout = SbtLayout {
    raygen,
    miss: vec![miss],
    hit: vec![hit],
    ..Default::default()
  };
  let config = RtLoweringConfig::default();
  let result = dispatch(&desc, config, mode, memory, &layout, lanes as u32);
  let words = result.words(output, lanes);
  (result, words)
}

#[test]
fn null_acceleration_structure_misses_every_ray() {
  for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
    let (result, words) = run_hit_kind_and_tmax_queries(mode, true);
    assert_eq!(words, vec![100f32.to_bits(); 16], "{mode:?}");
    if mode == ExecutionMode::Indirect {
      assert_eq!(
        result.launch_names(),
        vec!["raygen", "traversal", "miss", "raygen.resume1"]
      );
    }
  }
}

#[test]
fn closest_hit_sees_the_hit_kind_and_miss_the_original_tmax() {
  for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
    let (_, words) = run_hit_kind_and_tmax_queries(mode, false);
    assert_eq!(
      words,
      expected_row_hits(16, HIT_KIND_FRONT_FACING_TRIANGLE, 100f32.to_bits()),
      "{mode:?}"
    );
  }
}

fn count_ifs(block: &[Instr]) -> usize {
  block
    .iter()
    .map(|instr| match instr {
      Instr::If {
        then_block,
        else_block,
        ..
      } => 1 + count_ifs(then_block) + count_ifs(else_block),
      Instr::Loop { body } | Instr::Inlined { body, .. } => count_ifs(body),
      _ => 0,
    })
    .sum()
}

/// Prepares and emits the `kind` dispatch, growing `vars.stack_size` by what the cases need.
fn emit_inlined_dispatch(
  b: &mut ShaderBuilder,
  index: Node,
  can_have_null: bool,
  kind: InlineCaseKind,
  vars: &mut RtVariables,
  cx: &RtLoweringContext,
) {
  let dispatch = prepare_inlined_shaders(b, kind, cx).unwrap();
  vars.stack_size = vars.stack_size.max(dispatch.stack_size());
  dispatch.emit(b, index, can_have_null, vars);
}

/// Six miss programs dispatched by lane index, each writes `100 + its number` for its lane.
fn run_miss_dispatch(config: RtLoweringConfig, can_have_null: bool) -> (Vec<u32>, usize) {
  let lanes = 8;
  let mut memory = GlobalMemory::default();
  let output = memory.allocate_zeroed(4 * lanes, 16);

  let mut desc = RayTracingPipelineDescriptor::default();
  for i in 0..6 {
    desc.register_general(stage_shader(&format!("miss{i}"), ShaderStage::Miss, |b| {
      let lane = b.intrinsic(Intrinsic::LocalInvocationIndex, &[]);
      let address = lane_address(b, output, lane, 4);
      let value = b.imm_u32(100 + i);
      b.intrinsic_void(Intrinsic::StoreGlobal, &[value, address]);
    }));
  }
  let cx = RtLoweringContext {
    pipeline: &desc,
    config: &config,
    mode: ExecutionMode::Indirect,
  };

  let mut shader = Shader::new("dispatch", ShaderStage::RayGen);
  let mut vars = RtVariables::declare(&mut shader);
  let (mut b, _) = ShaderBuilder::from_shader(shader);
  let index = b.intrinsic(Intrinsic::LocalInvocationIndex, &[]);
  emit_inlined_dispatch(&mut b, index, can_have_null, InlineCaseKind::Miss, &mut vars, &cx);
  let shader = b.finish();
  validate_shader(&shader).unwrap();

  let mut state = WaveState::new(memory, lanes, 0, 0);
  WaveInterpreter::new(&shader, &mut state, &NoIntersectionUnit)
    .run(LaneMask::MAX)
    .unwrap();
  let words = (0..lanes as u64)
    .map(|lane| state.global.read_u32(output + 4 * lane).unwrap())
    .collect();
  (words, count_ifs(&shader.body))
}

#[test]
fn flat_and_binary_search_dispatch_agree() {
  let expected = vec![0, 100, 101, 102, 103, 104, 105, 0];
  let (flat, flat_ifs) = run_miss_dispatch(
    RtLoweringConfig::default().with_bsearch_threshold(100),
    false,
  );
  let (bsearch, bsearch_ifs) = run_miss_dispatch(
    RtLoweringConfig::default().with_bsearch_threshold(2),
    false,
  );
  assert_eq!(flat, expected);
  assert_eq!(bsearch, expected);
  assert_eq!(flat_ifs, 6);
  assert!(bsearch_ifs > flat_ifs);
}

#[test]
fn null_guard_wraps_dispatch_above_threshold() {
  let config = RtLoweringConfig::default()
    .with_bsearch_threshold(100)
    .with_null_check_threshold(3);
  let (guarded, guarded_ifs) = run_miss_dispatch(config, true);
  let (plain, plain_ifs) = run_miss_dispatch(config, false);
  assert_eq!(guarded, plain);
  assert_eq!(guarded_ifs, plain_ifs + 1);

  let few_cases = RtLoweringConfig::default()
    .with_bsearch_threshold(100)
    .with_null_check_threshold(7);
  let (_, ifs) = run_miss_dispatch(few_cases, true);
  assert_eq!(ifs, plain_ifs);
}

const SCHEDULED_STAGES: [ShaderStage; 5] = [
  ShaderStage::RayGen,
  ShaderStage::Miss,
  ShaderStage::ClosestHit,
  ShaderStage::Callable,
  ShaderStage::Traversal,
];

fn election_shader(stage: ShaderStage) -> Shader {
  let mut shader = Shader::new("select", stage);
  let vars = RtVariables::declare(&mut shader);
  let (mut b, _) = ShaderBuilder::from_shader(shader);
  vars.init_from_args(&mut b);
  insert_select_next_shader(&mut b, &vars, stage);
  let shader = b.finish();
  validate_shader(&shader).unwrap();
  shader
}

/// Runs the election over `lanes` and checks every active lane saw the same address.
fn run_election(shader: &Shader, lanes: &[Option<u64>]) -> Option<u64> {
  let active = lanes
    .iter()
    .enumerate()
    .filter(|(_, address)| address.is_some())
    .fold(0 as LaneMask, |mask, (lane, _)| mask | 1 << lane);
  if active == 0 {
    return None;
  }

  let mut state = WaveState::new(GlobalMemory::default(), lanes.len(), 0, 0);
  for (args, address) in state.args.iter_mut().zip(lanes) {
    if let Some(address) = address {
      args.set(ShaderArg::ShaderAddr, *address);
    }
  }
  WaveInterpreter::new(shader, &mut state, &NoIntersectionUnit)
    .run(active)
    .unwrap();

  let elected: Vec<u64> = (0..lanes.len())
    .filter(|lane| lanes[*lane].is_some())
    .map(|lane| state.args[lane].u64(ShaderArg::UniformShaderAddr))
    .collect();
  assert!(elected.windows(2).all(|pair| pair[0] == pair[1]));
  elected.first().copied()
}

#[test]
fn scheduler_election_matches_host_model() {
  let mut rng = StdRng::seed_from_u64(42);
  for stage in SCHEDULED_STAGES {
    let shader = election_shader(stage);
    for _ in 0..64 {
      let lanes: Vec<Option<u64>> = (0..16)
        .map(|_| {
          let address = (0x1000 + 0x40 * rng.gen_range(0..4u64)) | rng.gen_range(0..4u64);
          rng.gen_bool(0.75).then_some(address)
        })
        .collect();
      assert_eq!(
        run_election(&shader, &lanes),
        select_next_shader_addr(stage, &lanes)
      );
    }
  }
}

#[test]
fn scheduler_election_ignores_lane_order() {
  let mut rng = StdRng::seed_from_u64(7);
  // one program address per priority
  let mut lanes = vec![
    Some(0x1000),
    None,
    Some(0x2001),
    Some(0x1000),
    Some(0x3002),
    Some(0x2001),
    None,
    Some(0x4003),
    Some(0x3002),
    Some(0x1000),
  ];
  let expected = |stage: ShaderStage| match stage {
    ShaderStage::Traversal => 0x3000,
    _ => 0x4000,
  };
  let shaders: Vec<Shader> = SCHEDULED_STAGES.iter().map(|s| election_shader(*s)).collect();

  for _ in 0..32 {
    lanes.shuffle(&mut rng);
    for (stage, shader) in SCHEDULED_STAGES.iter().zip(&shaders) {
      assert_eq!(
        select_next_shader_addr(*stage, &lanes),
        Some(expected(*stage)),
        "{stage:?} {lanes:x?}"
      );
      assert_eq!(run_election(shader, &lanes), Some(expected(*stage)));
    }
  }

  // without callables the winner depends on what the stage can have produced
  lanes.retain(|address| *address != Some(0x4003));
  for _ in 0..32 {
    lanes.shuffle(&mut rng);
    assert_eq!(select_next_shader_addr(ShaderStage::RayGen, &lanes), Some(0x2000));
    assert_eq!(select_next_shader_addr(ShaderStage::Miss, &lanes), Some(0x3000));
    assert_eq!(select_next_shader_addr(ShaderStage::Callable, &lanes), Some(0x3000));
  }
}

#[test]
fn scheduler_prefers_nested_work() {
  let raygen = Some(0x1000);
  let traversal = Some(0x2001);
  let hit = Some(0x3002);
  let callable = Some(0x4003);

  assert_eq!(
    select_next_lane(ShaderStage::RayGen, &[raygen, hit, traversal]),
    Some(2)
  );
  // ray generation cannot have produced hit work, the hit lane is not preferred
  assert_eq!(select_next_lane(ShaderStage::RayGen, &[raygen, hit]), Some(0));
  assert_eq!(
    select_next_lane(ShaderStage::Miss, &[raygen, traversal, hit]),
    Some(2)
  );
  assert_eq!(
    select_next_lane(ShaderStage::ClosestHit, &[traversal, hit, callable]),
    Some(2)
  );
  assert_eq!(
    select_next_lane(ShaderStage::Traversal, &[traversal, None, hit, callable]),
    Some(2)
  );
  assert_eq!(select_next_lane(ShaderStage::Callable, &[None, None]), None);
  assert_eq!(
    select_next_shader_addr(ShaderStage::Miss, &[raygen, hit]),
    Some(0x3000)
  );
}

#[test]
fn sbt_entries_are_read_from_record_rows() {
  let handle = |ptr: u64, general: u32, other: u32| ShaderGroupHandle {
    recursive_shader_ptr: ptr,
    general_or_closest_hit_index: general,
    any_hit_or_intersection_index: other,
    padding: [0; 4],
  };
  let mut sbt = ShaderBindingTableBuilder::new(2);
  sbt.config_ray_generation(ShaderRecord::new(handle(0x100, 1, 0)));
  sbt.config_hit_group(0, 0, ShaderRecord::new(handle(0x200, 2, 3)));
  sbt.config_hit_group(
    1,
    1,
    ShaderRecord::new(handle(0x300, 4, 5)).with_inline_data(&77u32.to_le_bytes()),
  );
  let mut memory = GlobalMemory::default();
  let descriptor = sbt.write(&mut memory, [1, 1, 1]);
  let hit_table = memory
    .read_u64(descriptor + SbtTable::Hit.descriptor_offset())
    .unwrap();
  assert_eq!(
    memory
      .read_u64(descriptor + SbtTable::Hit.stride_offset())
      .unwrap(),
    64
  );

  let mut shader = Shader::new("sbt", ShaderStage::RayGen);
  let vars = RtVariables::declare(&mut shader);
  let (mut b, _) = ShaderBuilder::from_shader(shader);
  let index = b.load_arg(ShaderArg::PrimitiveId);
  load_sbt_entry(&mut b, &vars, index, SbtTable::Hit, SbtField::AnyHitIdx);
  let idx = b.load_var(vars.idx);
  b.store_arg(ShaderArg::HitKind, idx);
  load_sbt_entry(&mut b, &vars, index, SbtTable::Hit, SbtField::RecursivePtr);
  let ptr = b.load_var(vars.shader_addr);
  b.store_arg(ShaderArg::ShaderAddr, ptr);
  let record = b.load_var(vars.shader_record_ptr);
  b.store_arg(ShaderArg::ShaderRecordPtr, record);
  let shader = b.finish();

  let mut state = WaveState::new(memory, 2, 0, 0);
  for (args, row) in state.args.iter_mut().zip([0u32, 3]) {
    args.set(ShaderArg::SbtDescriptors, descriptor);
    args.set(ShaderArg::PrimitiveId, row);
  }
  WaveInterpreter::new(&shader, &mut state, &NoIntersectionUnit)
    .run(LaneMask::MAX)
    .unwrap();

  assert_eq!(state.args[0].u32(ShaderArg::HitKind), 3);
  assert_eq!(state.args[0].u64(ShaderArg::ShaderAddr), 0x200);
  assert_eq!(
    state.args[0].u64(ShaderArg::ShaderRecordPtr),
    hit_table + SBT_HANDLE_SIZE as u64
  );
  assert_eq!(state.args[1].u32(ShaderArg::HitKind), 5);
  assert_eq!(state.args[1].u64(ShaderArg::ShaderAddr), 0x300);
  let record = state.args[1].u64(ShaderArg::ShaderRecordPtr);
  assert_eq!(record, hit_table + 3 * 64 + SBT_HANDLE_SIZE as u64);
  assert_eq!(state.global.read_u32(record).unwrap(), 77);
}

#[test]
fn inlined_constants_are_rebased() {
  let mut dst = Shader::new("dst", ShaderStage::RayGen);
  dst.constant_data = vec![1; 10];

  let mut b = ShaderBuilder::new("src", ShaderStage::Miss);
  b.shader_mut().constant_data = vec![9; 8];
  let zero = b.imm_u32(0);
  b.intrinsic(
    Intrinsic::LoadConstant {
      ty: ValueType::U32,
      base: 0,
      align: 16,
    },
    &[zero],
  );
  let mut src = b.finish();

  inline_constants(&mut dst, &mut src);
  assert_eq!(dst.constant_data.len(), 72);
  assert_eq!(&dst.constant_data[64..], &[9; 8]);
  let mut loads = Vec::new();
  src.visit_instructions(|instr| {
    if let Instr::Intrinsic {
      op: Intrinsic::LoadConstant { base, align, .. },
      ..
    } = instr
    {
      loads.push((*base, *align));
    }
  });
  assert_eq!(loads, vec![(64, 16)]);
}

#[test]
fn group_handles_follow_stage_indices() {
  let mut desc = RayTracingPipelineDescriptor::default();
  desc.register_general(payload_writer("raygen", ShaderStage::RayGen, 0));
  let chit = desc.register_stage(payload_writer("chit", ShaderStage::ClosestHit, 0));
  let any_hit = desc.register_stage(Shader::new("ahit", ShaderStage::AnyHit));
  let intersection = desc.register_stage(Shader::new("isec", ShaderStage::Intersection));

  let triangles = ShaderGroup::TrianglesHitGroup {
    closest_hit: Some(chit),
    any_hit: Some(any_hit),
  };
  let procedural = ShaderGroup::ProceduralHitGroup {
    closest_hit: None,
    any_hit: Some(any_hit),
    intersection,
  };
  assert_eq!(
    desc.group_handle_indices(&triangles),
    GroupHandleIndices {
      general_or_closest_hit: chit + 1,
      any_hit_or_intersection: any_hit + 1,
    }
  );
  let procedural_indices = desc.group_handle_indices(&procedural);
  assert_eq!(procedural_indices.general_or_closest_hit, 0);
  assert_eq!(
    procedural_indices.any_hit_or_intersection,
    desc.intersection_handle_index(intersection, Some(any_hit))
  );
  assert_ne!(
    desc.intersection_handle_index(intersection, Some(any_hit)),
    desc.intersection_handle_index(intersection, None)
  );
}

fn compile_error(desc: &RayTracingPipelineDescriptor, mode: ExecutionMode) -> RtCompileError {
  RayTracingPipelineCompiler::new(RtLoweringConfig::default())
    .compile(desc, mode)
    .unwrap_err()
}

fn tracing_raygen() -> Shader {
  trace_raygen(&RayGenDesc {
    accel: 0,
    output: 0,
    rays: RaySource::Row { x_start: 0. },
    ray_flags: 0,
    payload_words: 1,
  })
}

#[test]
fn invalid_pipelines_are_rejected() {
  let mut desc = RayTracingPipelineDescriptor::default();
  desc.register_general(payload_writer("miss", ShaderStage::Miss, 0));
  assert_eq!(
    compile_error(&desc, ExecutionMode::Indirect),
    RtCompileError::MissingRayGen
  );

  let mut desc = RayTracingPipelineDescriptor::default().with_max_recursion_depth(32);
  desc.register_general(tracing_raygen());
  assert_eq!(
    compile_error(&desc, ExecutionMode::Indirect),
    RtCompileError::RecursionDepthTooLarge(32)
  );

  let mut desc = RayTracingPipelineDescriptor::default().with_max_recursion_depth(0);
  desc.register_general(tracing_raygen());
  assert_eq!(
    compile_error(&desc, ExecutionMode::Indirect),
    RtCompileError::RecursionDepthZero("raygen".into())
  );

  let mut desc = RayTracingPipelineDescriptor::default();
  desc.register_general(tracing_raygen());
  let miss = desc.register_stage(payload_writer("miss", ShaderStage::Miss, 0));
  desc.register_group(ShaderGroup::TrianglesHitGroup {
    closest_hit: Some(miss),
    any_hit: None,
  });
  assert!(matches!(
    compile_error(&desc, ExecutionMode::Indirect),
    RtCompileError::StageKindMismatch {
      expected: ShaderStage::ClosestHit,
      found: ShaderStage::Miss,
      ..
    }
  ));
}

#[test]
fn stage_intrinsics_are_checked() {
  let mut desc = RayTracingPipelineDescriptor::default();
  desc.register_general(tracing_raygen());
  desc.register_stage(stage_shader("chit", ShaderStage::ClosestHit, |b| {
    b.intrinsic_void(Intrinsic::IgnoreIntersection, &[]);
  }));
  assert!(matches!(
    compile_error(&desc, ExecutionMode::Indirect),
    RtCompileError::UnsupportedIntrinsic {
      stage: ShaderStage::ClosestHit,
      intrinsic: Intrinsic::IgnoreIntersection,
      ..
    }
  ));

  let mut desc = RayTracingPipelineDescriptor::default();
  desc.register_general(tracing_raygen());
  desc.register_stage(stage_shader("ahit", ShaderStage::AnyHit, |b| {
    let payload = b.imm_u32(0);
    let index = b.imm_u32(0);
    b.intrinsic_void(
      Intrinsic::ExecuteCallable {
        call_idx: 0,
        stack_size: 0,
      },
      &[index, payload],
    );
  }));
  assert!(matches!(
    compile_error(&desc, ExecutionMode::Indirect),
    RtCompileError::UnsupportedIntrinsic {
      stage: ShaderStage::AnyHit,
      ..
    }
  ));
}

/// reserves one zeroed payload word at frame offset 0
fn frame_payload(b: &mut ShaderBuilder) -> Node {
  b.shader_mut().scratch_size = 16;
  let offset = b.imm_u32(0);
  b.intrinsic_void(
    Intrinsic::StoreScratch {
      base: ScratchBase::Frame,
    },
    &[offset, offset],
  );
  offset
}

fn read_frame_word(b: &mut ShaderBuilder, offset: Node) -> Node {
  b.intrinsic(
    Intrinsic::LoadScratch {
      ty: ValueType::U32,
      base: ScratchBase::Frame,
    },
    &[offset],
  )
}

/// down -z from `(column - 8, 0.25, 1)`
fn row_ray(b: &mut ShaderBuilder, column: Node) -> Ray {
  let x = b.alu(AluOp::U2F, &[column]);
  let start = b.imm_f32(-8.);
  let x = b.fadd(x, start);
  let y = b.imm_f32(0.25);
  let z = b.imm_f32(1.);
  Ray {
    origin: b.construct(ValueType::Vec3, &[x, y, z]),
    direction: b.imm(Value::Vec3([0., 0., -1.])),
    tmax: 100.,
  }
}

#[test]
fn trace_inside_if_resumes_after_the_branch() {
  let lanes = 16;
  let mut outputs = Vec::new();
  for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
    let scene = triangle_scene_with(lanes, |accel, output| {
      stage_shader("raygen", ShaderStage::RayGen, |b| {
        let payload = frame_payload(b);
        let lane = launch_index(b);
        let odd = b.test_mask(lane, 1);
        b.if_by(odd, |b| {
          let ray = row_ray(b, lane);
          trace_ray(b, accel, 0, 0, ray, payload);
        });
        let value = read_frame_word(b, payload);
        let address = lane_address(b, output, lane, 4);
        b.intrinsic_void(Intrinsic::StoreGlobal, &[value, address]);
      })
    });
    let config = RtLoweringConfig::default();
    let result = dispatch(&scene.desc, config, mode, scene.memory, &scene.layout, lanes);
    if mode == ExecutionMode::Indirect {
      assert_eq!(
        result.launch_names(),
        vec!["raygen", "traversal", "miss", "chit", "raygen.resume1"]
      );
      assert_eq!(result.trace[4].active, 0xaaaa);
      result.assert_stack_in_bounds();
    }
    outputs.push(result.words(scene.output, lanes as usize));
  }

  // even lanes skip the trace and keep the zeroed payload
  let expected: Vec<u32> = expected_row_hits(lanes, 103, MISS_VALUE)
    .into_iter()
    .enumerate()
    .map(|(lane, value)| if lane % 2 == 1 { value } else { 0 })
    .collect();
  assert_eq!(outputs[0], expected);
  assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn trace_inside_loop_resumes_every_iteration() {
  let lanes = 16;
  let bounces = 3;
  let mut outputs = Vec::new();
  for mode in [ExecutionMode::Indirect, ExecutionMode::Monolithic] {
    // bounce k shifts the ray by 4k columns
    let scene = triangle_scene_with(lanes, |accel, output| {
      stage_shader("raygen", ShaderStage::RayGen, |b| {
        let payload = frame_payload(b);
        let lane = launch_index(b);
        let sum = b.make_local_var("sum", Value::U32(0));
        let bounce = b.make_local_var("bounce", Value::U32(0));
        b.loop_by(|b| {
          let k = b.load_var(bounce);
          let shift = b.imul_imm(k, 4);
          let column = b.iadd(lane, shift);
          let ray = row_ray(b, column);
          trace_ray(b, accel, 0, 0, ray, payload);

          let value = read_frame_word(b, payload);
          let total = b.load_var(sum);
          let total = b.iadd(total, value);
          b.store_var(sum, total);
          let k = b.load_var(bounce);
          let k = b.iadd_imm(k, 1);
          b.store_var(bounce, k);
          let done = b.ieq_imm(k, bounces);
          b.break_if(done);
        });
        let total = b.load_var(sum);
        let address = lane_address(b, output, lane, 4);
        b.intrinsic_void(Intrinsic::StoreGlobal, &[total, address]);
      })
    });
    let config = RtLoweringConfig::default();
    let result = dispatch(&scene.desc, config, mode, scene.memory, &scene.layout, lanes);
    if mode == ExecutionMode::Indirect {
      // lane 0 misses the first two bounces and hits the last one
      assert_eq!(
        result.launch_names(),
        vec![
          "raygen",
          "traversal",
          "miss",
          "chit",
          "raygen.resume1",
          "traversal",
          "miss",
          "chit",
          "raygen.resume1",
          "traversal",
          "chit",
          "miss",
          "raygen.resume1",
        ]
      );
      let last = result.trace.last().unwrap();
      assert!(last.stack_ptrs[..lanes as usize].iter().all(|sp| *sp == Some(0)));
      result.assert_stack_in_bounds();
    }
    outputs.push(result.words(scene.output, lanes as usize));
  }

  let expected: Vec<u32> = (0..lanes as i32)
    .map(|lane| {
      (0..bounces as i32)
        .map(|k| {
          let x = lane - 8 + 4 * k;
          if x.abs() <= 3 {
            103
          } else {
            MISS_VALUE
          }
        })
        .sum()
    })
    .collect();
  assert_eq!(outputs[0], expected);
  assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn callable_inside_inlined_region_suspends_the_program() {
  let lanes = 8;
  let mut memory = GlobalMemory::default();
  let output = memory.allocate_zeroed(4 * lanes, 16);
  let visits = memory.allocate_zeroed(4 * lanes, 16);

  let mut desc = RayTracingPipelineDescriptor::default();
  let raygen = desc.register_general(stage_shader("raygen", ShaderStage::RayGen, |b| {
    let payload = frame_payload(b);
    let lane = launch_index(b);
    b.inlined_by("shade", |b| {
      let parity = b.iand_imm(lane, 1);
      let even = b.ieq_imm(parity, 0);
      b.if_by(even, |b| {
        let value = b.iadd_imm(lane, 1000);
        let address = lane_address(b, output, lane, 4);
        b.intrinsic_void(Intrinsic::StoreGlobal, &[value, address]);
        b.do_return();
      });
      let index = b.imm_u32(0);
      b.intrinsic_void(
        Intrinsic::ExecuteCallable {
          call_idx: 0,
          stack_size: 0,
        },
        &[index, payload],
      );
      let value = read_frame_word(b, payload);
      let value = b.iadd(value, lane);
      let address = lane_address(b, output, lane, 4);
      b.intrinsic_void(Intrinsic::StoreGlobal, &[value, address]);
    });
    // runs once per lane, after the region finished for it
    let address = lane_address(b, visits, lane, 4);
    let count = b.load_global(ValueType::U32, address);
    let count = b.iadd_imm(count, 1);
    b.intrinsic_void(Intrinsic::StoreGlobal, &[count, address]);
  }));
  let callable = desc.register_general(payload_writer("callable", ShaderStage::Callable, 41));
  let miss = desc.register_general(payload_writer("miss", ShaderStage::Miss, MISS_VALUE));

  let layout = SbtLayout {
    raygen,
    miss: vec![miss],
    callable: vec![callable],
    ..Default::default()
  };
  let result = dispatch(
    &desc,
    RtLoweringConfig::default(),
    ExecutionMode::Indirect,
    memory,
    &layout,
    lanes as u32,
  );

  let expected: Vec<u32> = (0..lanes as u32)
    .map(|lane| if lane % 2 == 0 { 1000 + lane } else { 41 + lane })
    .collect();
  assert_eq!(result.words(output, lanes), expected);
  assert_eq!(result.words(visits, lanes), vec![1; lanes]);
  assert_eq!(
    result.launch_names(),
    vec!["raygen", "callable", "raygen.resume1"]
  );
  assert_eq!(result.trace[2].active, 0xaa);
  result.assert_stack_in_bounds();
}

#[test]
fn calls_in_different_branches_get_their_own_resume_programs() {
  let mut desc = RayTracingPipelineDescriptor::default();
  desc.register_general(stage_shader("raygen", ShaderStage::RayGen, |b| {
    let payload = frame_payload(b);
    let lane = launch_index(b);
    let odd = b.test_mask(lane, 1);
    let call = |b: &mut ShaderBuilder, index: u32| {
      let index = b.imm_u32(index);
      b.intrinsic_void(
        Intrinsic::ExecuteCallable {
          call_idx: 0,
          stack_size: 0,
        },
        &[index, payload],
      );
    };
    b.if_by(odd, |b| call(b, 0)).else_by(b, |b| call(b, 1));
    b.loop_by(|b| {
      call(b, 0);
      b.do_break();
    });
  }));
  desc.register_general(payload_writer("callable", ShaderStage::Callable, 1));

  let compiled = RayTracingPipelineCompiler::new(RtLoweringConfig::default())
    .compile(&desc, ExecutionMode::Indirect)
    .unwrap();
  let names: Vec<&str> = compiled.programs.iter().map(|p| p.name.as_str()).collect();
  assert_eq!(
    names,
    vec![
      "raygen",
      "raygen.resume1",
      "raygen.resume2",
      "raygen.resume3",
      "callable",
      "traversal"
    ]
  );
  for idx in 1..=3 {
    let program = compiled.resume_programs[&idx];
    assert_eq!(compiled.programs[program].resume_call_idx, Some(idx));
  }
  for program in &compiled.programs {
    validate_shader(&program.shader).unwrap();
  }
}

#[test]
fn monolithic_limits() {
  let mut desc = RayTracingPipelineDescriptor::default();
  desc.register_general(tracing_raygen());
  desc.register_general(payload_writer("callable", ShaderStage::Callable, 0));
  assert!(matches!(
    compile_error(&desc, ExecutionMode::Monolithic),
    RtCompileError::MonolithicUnsupported(_)
  ));

  let mut desc = RayTracingPipelineDescriptor::default().with_max_recursion_depth(2);
  desc.register_general(tracing_raygen());
  assert!(matches!(
    compile_error(&desc, ExecutionMode::Monolithic),
    RtCompileError::MonolithicUnsupported(_)
  ));

  let mut desc = RayTracingPipelineDescriptor::default();
  desc.register_general(tracing_raygen());
  desc.register_general(payload_writer("miss", ShaderStage::Miss, 0));
  let compiled = RayTracingPipelineCompiler::new(RtLoweringConfig::default())
    .compile(&desc, ExecutionMode::Monolithic)
    .unwrap();
  assert_eq!(compiled.programs.len(), 1);
  assert!(compiled.traversal_program.is_none());
  assert_eq!(compiled.group_programs, vec![Some(0), None]);
}

#[test]
fn indirect_programs_and_stack_size() {
  let scene = triangle_scene(1, 0);
  let compiled = RayTracingPipelineCompiler::new(RtLoweringConfig::default())
    .compile(&scene.desc, ExecutionMode::Indirect)
    .unwrap();

  let names: Vec<&str> = compiled.programs.iter().map(|p| p.name.as_str()).collect();
  assert_eq!(names, vec!["raygen", "raygen.resume1", "miss", "chit", "traversal"]);
  let resume = compiled.program_by_name("raygen.resume1").unwrap();
  assert_eq!(resume.resume_call_idx, Some(1));
  assert_eq!(compiled.resume_programs.get(&1), Some(&1));
  assert_eq!(compiled.stage_program(0), Some(0));

  let size = |name: &str| compiled.program_by_name(name).unwrap().stack_size;
  let expected = size("raygen").max(size("raygen.resume1"))
    + size("traversal").max(size("miss")).max(size("chit"));
  assert_eq!(compiled.stack_size, expected);

  for program in &compiled.programs {
    assert_eq!(
      program
        .shader
        .count_intrinsics(|op| op.is_ray_tracing()),
      0,
      "{} still has ray tracing intrinsics",
      program.name
    );
  }
}

#[test]
fn launch_limit_stops_runaway_dispatch() {
  let scene = triangle_scene(4, 0);
  let compiled = RayTracingPipelineCompiler::new(RtLoweringConfig::default())
    .compile(&scene.desc, ExecutionMode::Indirect)
    .unwrap();
  let mut emulator = DispatchEmulator::new(
    &compiled,
    scene.memory,
    EmulatorConfig::default().with_max_launches(2),
  )
  .unwrap();
  let record = |group: u32| ShaderRecord::new(emulator.group_handle(group).unwrap());
  let mut sbt = ShaderBindingTableBuilder::new(1);
  sbt.config_ray_generation(record(scene.layout.raygen));
  sbt.config_missing(0, record(scene.layout.miss[0]));
  sbt.config_hit_group(0, 0, record(scene.layout.hit[0]));

  assert_eq!(
    emulator.dispatch(&sbt, [4, 1, 1]),
    Err(DispatchError::LaunchLimit {
      wave: 0,
      launches: 2
    })
  );
  assert!(emulator.memory().read_u32(scene.output).is_ok());

  let empty = ShaderBindingTableBuilder::new(1);
  assert_eq!(
    emulator.dispatch(&empty, [4, 1, 1]),
    Err(DispatchError::MissingRayGenRecord(0))
  );
}

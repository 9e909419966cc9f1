use crate::*;

/// Rewrites a copy of the any-hit program for being spliced into an intersection program:
/// rejection clears `commit`, the candidate `t` and hit kind come in as parameters and its
/// scratch moves behind the intersection program's frame.
fn prepare_any_hit(any_hit: &Shader, scratch_offset: u32) -> (Shader, VariableId) {
  let mut any_hit = any_hit.clone();
  let commit = any_hit.declare_variable("commit", ValueType::Bool);
  any_hit.params = vec![ValueType::F32, ValueType::U32];

  let any_hit = infallible(rewrite_intrinsics(any_hit, |b, dst, op, srcs| {
    Ok(match op {
      Intrinsic::IgnoreIntersection => {
        b.store_imm(commit, false);
        b.do_return();
        true
      }
      Intrinsic::RayTMax => {
        let t = b.intrinsic(Intrinsic::LoadParam(0), &[]);
        define(b, dst, t);
        true
      }
      Intrinsic::HitKind => {
        let kind = b.intrinsic(Intrinsic::LoadParam(1), &[]);
        define(b, dst, kind);
        true
      }
      Intrinsic::LoadScratch {
        ty,
        base: ScratchBase::Frame,
      } => {
        let offset = b.iadd_imm(srcs[0], scratch_offset);
        let value = b.intrinsic(
          Intrinsic::LoadScratch {
            ty,
            base: ScratchBase::Frame,
          },
          &[offset],
        );
        define(b, dst, value);
        true
      }
      Intrinsic::StoreScratch {
        base: ScratchBase::Frame,
      } => {
        let offset = b.iadd_imm(srcs[1], scratch_offset);
        b.intrinsic_void(
          Intrinsic::StoreScratch {
            base: ScratchBase::Frame,
          },
          &[srcs[0], offset],
        );
        true
      }
      _ => false,
    })
  }));
  (any_hit, commit)
}

/// Fuses the any-hit program of a procedural hit group into its intersection program.
///
/// Every `report_intersection(t, kind)` runs the any-hit program for non opaque candidates
/// inside the interval and only reports the candidate when it was not ignored. The result of
/// the report is whether the candidate got committed.
pub fn lower_intersection_shader(intersection: Shader, any_hit: &Shader) -> Shader {
  let mut intersection = intersection;
  let scratch_offset = align_up(intersection.scratch_size, 16);
  let (mut any_hit, any_hit_commit) = prepare_any_hit(any_hit, scratch_offset);
  inline_constants(&mut intersection, &mut any_hit);
  intersection.scratch_size = scratch_offset + any_hit.scratch_size;
  let commit = intersection.declare_variable("commit", ValueType::Bool);

  let shader = infallible(rewrite_intrinsics(intersection, |b, dst, op, srcs| {
    if op != Intrinsic::ReportIntersection {
      return Ok(false);
    }
    let (t, kind) = (srcs[0], srcs[1]);
    b.store_imm(commit, false);

    let tmin = b.intrinsic(Intrinsic::RayTMin, &[]);
    let tmax = b.intrinsic(Intrinsic::RayTMax, &[]);
    let above_min = b.fge(t, tmin);
    let below_max = b.fge(tmax, t);
    let in_range = b.iand(above_min, below_max);
    b.if_by(in_range, |b| {
      b.store_imm(commit, true);
      let opaque = b.intrinsic(Intrinsic::IntersectionOpaque, &[]);
      let non_opaque = b.inot(opaque);
      b.if_by(non_opaque, |b| {
        let mut variables = FastHashMap::default();
        variables.insert(any_hit_commit, commit);
        b.inline_shader(
          &any_hit,
          &InlineBinding {
            variables,
            params: &[t, kind],
          },
        );
      });
      let committed = b.load_var(commit);
      b.if_by(committed, |b| {
        b.intrinsic(Intrinsic::ReportIntersection, &[t, kind]);
      });
    });

    let committed = b.load_var(commit);
    define(b, dst, committed);
    Ok(true)
  }));

  debug!("fused any hit {} into {}", any_hit.name, shader.name);
  shader
}

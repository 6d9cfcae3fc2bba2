//! The per-device subdomain: allocations, halo geometry, region transfers.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::{Device, DeviceBuffer, DeviceStream, RegionSpec};
use crate::error::{HaloError, Result};
use crate::geom::{Box3, Coord3, Radius};

/// Handle returned by field registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldId(pub(crate) usize);

impl FieldId {
    /// Position of the field in registration order.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A registered field: element size in bytes plus a diagnostic name. The
/// engine records no element type.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Element size in bytes.
    pub elem_size: usize,
    /// Human-readable name.
    pub name: String,
}

struct FieldSlot {
    spec: FieldSpec,
    curr: Arc<dyn DeviceBuffer>,
    next: Arc<dyn DeviceBuffer>,
}

/// One contiguous rectangular piece of the global volume owned by one
/// (rank, device) pair.
///
/// Each field is a single dense allocation including the halo rim, indexed
/// `z*(sy*sx) + y*sx + x` over the raw extent. `curr` and `next` have
/// identical shape; `swap` exchanges them between iterations.
pub struct Subdomain {
    index: Coord3,
    origin: Coord3,
    size: Coord3,
    radius: Radius,
    device: Arc<dyn Device>,
    stream: Arc<dyn DeviceStream>,
    fields: RwLock<Vec<FieldSlot>>,
}

impl Subdomain {
    pub(crate) fn new(
        index: Coord3,
        origin: Coord3,
        size: Coord3,
        radius: Radius,
        device: Arc<dyn Device>,
        specs: &[FieldSpec],
    ) -> Result<Self> {
        let stream = device.new_stream()?;
        let raw = size + radius.neg() + radius.pos();
        let cells = raw.flatten() as usize;

        let mut fields = Vec::with_capacity(specs.len());
        for spec in specs {
            let len = cells * spec.elem_size;
            let curr = device.alloc(len, spec.elem_size)?;
            let next = device.alloc(len, spec.elem_size)?;
            fields.push(FieldSlot {
                spec: spec.clone(),
                curr,
                next,
            });
        }

        Ok(Self {
            index,
            origin,
            size,
            radius,
            device,
            stream,
            fields: RwLock::new(fields),
        })
    }

    /// Subdomain index in the product grid.
    pub fn index(&self) -> Coord3 {
        self.index
    }

    /// Origin of the compute region in global coordinates.
    pub fn origin(&self) -> Coord3 {
        self.origin
    }

    /// Compute extent, halo excluded.
    pub fn size(&self) -> Coord3 {
        self.size
    }

    /// Halo radius.
    pub fn radius(&self) -> Radius {
        self.radius
    }

    /// Owning device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// This subdomain's compute stream.
    pub fn stream(&self) -> &Arc<dyn DeviceStream> {
        &self.stream
    }

    /// Raw allocation extent: compute size plus both rims per axis.
    pub fn raw_size(&self) -> Coord3 {
        self.size + self.radius.neg() + self.radius.pos()
    }

    /// Extent of the halo region on the `d` side: the compute extent on
    /// axes where `d` is zero, the rim thickness of the `d` side elsewhere.
    pub fn halo_extent(&self, d: Coord3) -> Coord3 {
        self.extent_with(self.radius.side(d), d)
    }

    /// Extent of the interior slab sent in direction `d`: the thickness the
    /// receiving neighbor's rim has on its `-d` side. Identical to
    /// [`Subdomain::halo_extent`] for symmetric radii.
    pub fn send_extent(&self, d: Coord3) -> Coord3 {
        self.extent_with(self.radius.side(-d), d)
    }

    fn extent_with(&self, rim: Coord3, d: Coord3) -> Coord3 {
        Coord3::new(
            if d.x == 0 { self.size.x } else { rim.x },
            if d.y == 0 { self.size.y } else { rim.y },
            if d.z == 0 { self.size.z } else { rim.z },
        )
    }

    /// Origin, in allocation coordinates, of either the halo region
    /// (`halo = true`, just outside the compute region) or the interior
    /// send region (`halo = false`, just inside it) on the `d` side.
    pub fn halo_pos(&self, d: Coord3, halo: bool) -> Coord3 {
        let ofs = self.radius.neg();
        let axis = |d: i64, ofs: i64, sz: i64, neg: i64| -> i64 {
            match d {
                i64::MIN..=-1 => {
                    if halo {
                        0
                    } else {
                        ofs
                    }
                }
                0 => ofs,
                _ => {
                    if halo {
                        ofs + sz
                    } else {
                        ofs + sz - neg
                    }
                }
            }
        };
        Coord3::new(
            axis(d.x, ofs.x, self.size.x, ofs.x),
            axis(d.y, ofs.y, self.size.y, ofs.y),
            axis(d.z, ofs.z, self.size.z, ofs.z),
        )
    }

    /// Bytes of one received halo message on the `d` side, summed over all
    /// fields in registration order.
    pub fn halo_bytes(&self, d: Coord3) -> usize {
        let cells = self.halo_extent(d).flatten() as usize;
        self.fields
            .read()
            .iter()
            .map(|f| f.spec.elem_size * cells)
            .sum()
    }

    /// Bytes of one sent halo message in direction `d`.
    pub fn send_bytes(&self, d: Coord3) -> usize {
        let cells = self.send_extent(d).flatten() as usize;
        self.fields
            .read()
            .iter()
            .map(|f| f.spec.elem_size * cells)
            .sum()
    }

    /// Number of registered fields.
    pub fn field_count(&self) -> usize {
        self.fields.read().len()
    }

    /// Element size of a field in bytes.
    pub fn elem_size(&self, f: FieldId) -> usize {
        self.fields.read()[f.0].spec.elem_size
    }

    /// Diagnostic name of a field.
    pub fn field_name(&self, f: FieldId) -> String {
        self.fields.read()[f.0].spec.name.clone()
    }

    /// The current front buffer of a field.
    pub fn curr(&self, f: FieldId) -> Arc<dyn DeviceBuffer> {
        Arc::clone(&self.fields.read()[f.0].curr)
    }

    /// The current back buffer of a field.
    pub fn next(&self, f: FieldId) -> Arc<dyn DeviceBuffer> {
        Arc::clone(&self.fields.read()[f.0].next)
    }

    /// Element sizes and front buffers of every field, registration order.
    /// Transports take this snapshot on each send so `swap` is observed.
    pub fn curr_buffers(&self) -> Vec<(usize, Arc<dyn DeviceBuffer>)> {
        self.fields
            .read()
            .iter()
            .map(|f| (f.spec.elem_size, Arc::clone(&f.curr)))
            .collect()
    }

    /// Exchange `curr` and `next` for every field. Runs outside `exchange`;
    /// the write lock excludes in-flight transport snapshots.
    pub fn swap(&self) {
        for f in self.fields.write().iter_mut() {
            std::mem::swap(&mut f.curr, &mut f.next);
        }
    }

    /// The compute cells whose stencil reads stay inside the compute
    /// region, in allocation coordinates.
    pub fn interior_box(&self) -> Box3 {
        let ofs = self.radius.neg();
        Box3::new(
            ofs + self.radius.neg(),
            ofs + self.size - self.radius.pos(),
        )
    }

    /// The compute cells that read halo data: the complement of
    /// [`Subdomain::interior_box`] within the compute region, as disjoint
    /// slabs in allocation coordinates. Empty for a zero radius.
    pub fn exterior_boxes(&self) -> Vec<Box3> {
        let ofs = self.radius.neg();
        let lo = ofs;
        let hi = ofs + self.size;
        let ilo = self.interior_box().lo;
        let ihi = self.interior_box().hi;

        let mut out = Vec::new();
        let mut push = |b: Box3| {
            if !b.is_empty() {
                out.push(b);
            }
        };

        // X slabs span the full Y/Z extent; Y slabs shrink in X; Z slabs
        // shrink in both, so the union is disjoint.
        push(Box3::new(lo, Coord3::new(ilo.x, hi.y, hi.z)));
        push(Box3::new(Coord3::new(ihi.x, lo.y, lo.z), hi));
        push(Box3::new(
            Coord3::new(ilo.x, lo.y, lo.z),
            Coord3::new(ihi.x, ilo.y, hi.z),
        ));
        push(Box3::new(
            Coord3::new(ilo.x, ihi.y, lo.z),
            Coord3::new(ihi.x, hi.y, hi.z),
        ));
        push(Box3::new(
            Coord3::new(ilo.x, ilo.y, lo.z),
            Coord3::new(ihi.x, ihi.y, ilo.z),
        ));
        push(Box3::new(
            Coord3::new(ilo.x, ilo.y, ihi.z),
            Coord3::new(ihi.x, ihi.y, hi.z),
        ));
        out
    }

    fn check_region(&self, pos: Coord3, ext: Coord3) -> Result<()> {
        let raw = self.raw_size();
        let end = pos + ext;
        if pos.x < 0
            || pos.y < 0
            || pos.z < 0
            || end.x > raw.x
            || end.y > raw.y
            || end.z > raw.z
        {
            return Err(HaloError::InvalidConfig(format!(
                "region {pos}+{ext} outside allocation {raw}"
            )));
        }
        Ok(())
    }

    /// Gather a region of a field's front buffer to host bytes. `pos` is in
    /// allocation coordinates.
    pub fn region_to_host(&self, pos: Coord3, ext: Coord3, f: FieldId) -> Result<Vec<u8>> {
        self.check_region(pos, ext)?;
        let (elem, curr) = {
            let fields = self.fields.read();
            let slot = &fields[f.0];
            (slot.spec.elem_size, Arc::clone(&slot.curr))
        };
        let region = RegionSpec {
            raw: self.raw_size(),
            pos,
            ext,
            elem,
        };
        let stage = self.device.alloc(region.bytes(), elem)?;
        self.stream.pack(&*stage, 0, &*curr, region)?;
        let mut out = vec![0u8; region.bytes()];
        self.stream.copy_to_host(&mut out, &*stage, 0)?;
        self.stream.synchronize()?;
        Ok(out)
    }

    /// Scatter host bytes into a region of a field's front buffer; the
    /// inverse of [`Subdomain::region_to_host`], used to set initial values.
    pub fn region_from_host(
        &self,
        pos: Coord3,
        ext: Coord3,
        f: FieldId,
        bytes: &[u8],
    ) -> Result<()> {
        self.check_region(pos, ext)?;
        let (elem, curr) = {
            let fields = self.fields.read();
            let slot = &fields[f.0];
            (slot.spec.elem_size, Arc::clone(&slot.curr))
        };
        let region = RegionSpec {
            raw: self.raw_size(),
            pos,
            ext,
            elem,
        };
        if bytes.len() != region.bytes() {
            return Err(HaloError::LengthMismatch {
                expected: region.bytes(),
                actual: bytes.len(),
            });
        }
        let stage = self.device.alloc(region.bytes(), elem)?;
        self.stream.copy_from_host(&*stage, 0, bytes)?;
        self.stream.unpack(&*curr, region, &*stage, 0)?;
        self.stream.synchronize()?;
        Ok(())
    }
}

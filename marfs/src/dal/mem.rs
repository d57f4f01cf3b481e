//! In-memory DAL driver. Holds every object as a plain byte vector
//! behind one store lock; write handles stage into a private buffer and
//! only publish on close, so an aborted or crashed write never leaves a
//! half-visible object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Dal, DalMode, DalObject, Erasure, Location, StripeState};
use crate::error::Error;

#[derive(Debug, Default)]
struct MemDalState {
    objects: HashMap<String, Vec<u8>>,
    /// Injected per-object damage counts, consumed by `rebuild`.
    damage: HashMap<String, u32>,
}

/// Shared in-memory object store.
#[derive(Debug, Default, Clone)]
pub struct MemDal {
    state: Arc<Mutex<MemDalState>>,
}

impl MemDal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: mark an object as carrying `blocks` damaged blocks.
    pub fn inject_damage(&self, objname: &str, blocks: u32) {
        self.state
            .lock()
            .unwrap()
            .damage
            .insert(objname.to_string(), blocks);
    }

    /// Test hook: raw object content, if present.
    pub fn object_bytes(&self, objname: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(objname).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }
}

impl Dal for MemDal {
    fn open(
        &self,
        objname: &str,
        _loc: Location,
        _erasure: Erasure,
        mode: DalMode,
    ) -> crate::Result<Box<dyn DalObject>> {
        let state = self.state.lock().unwrap();
        match mode {
            DalMode::Read => {
                let data = state
                    .objects
                    .get(objname)
                    .ok_or_else(|| Error::not_found(format!("object \"{objname}\"")))?
                    .clone();
                Ok(Box::new(MemObject {
                    store: self.state.clone(),
                    name: objname.to_string(),
                    data,
                    pos: 0,
                    writable: false,
                }))
            }
            DalMode::Write => Ok(Box::new(MemObject {
                store: self.state.clone(),
                name: objname.to_string(),
                data: Vec::new(),
                pos: 0,
                writable: true,
            })),
            DalMode::Rebuild => Err(Error::inval(
                "rebuild handles are driven through Dal::rebuild".to_string(),
            )),
        }
    }

    fn delete(&self, objname: &str, _loc: Location) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.damage.remove(objname);
        if state.objects.remove(objname).is_none() {
            return Err(Error::not_found(format!("object \"{objname}\"")));
        }
        Ok(())
    }

    fn stat(&self, objname: &str, _loc: Location) -> crate::Result<u64> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(objname)
            .map(|d| d.len() as u64)
            .ok_or_else(|| Error::not_found(format!("object \"{objname}\"")))
    }

    fn rebuild(
        &self,
        objname: &str,
        _loc: Location,
        erasure: Erasure,
        hint: Option<&StripeState>,
    ) -> crate::Result<u32> {
        let mut state = self.state.lock().unwrap();
        if !state.objects.contains_key(objname) {
            return Err(Error::not_found(format!("object \"{objname}\"")));
        }
        let damaged = state.damage.remove(objname).unwrap_or(0);
        // Seeded known-good blocks do not need re-verification.
        let seeded = hint
            .map(|h| h.data_status.iter().filter(|ok| **ok).count() as u32)
            .unwrap_or(0);
        let repairable = erasure.e as u32 + seeded;
        if damaged > repairable {
            let remaining = damaged - repairable;
            state.damage.insert(objname.to_string(), remaining);
            return Ok(remaining);
        }
        Ok(0)
    }
}

struct MemObject {
    store: Arc<Mutex<MemDalState>>,
    name: String,
    data: Vec<u8>,
    pos: usize,
    writable: bool,
}

impl DalObject for MemObject {
    fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if self.writable {
            return Err(Error::inval("read from a write handle"));
        }
        let avail = self.data.len().saturating_sub(self.pos);
        let count = avail.min(buf.len());
        buf[..count].copy_from_slice(&self.data[self.pos..self.pos + count]);
        self.pos += count;
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> crate::Result<usize> {
        if !self.writable {
            return Err(Error::inval("write to a read handle"));
        }
        if self.pos > self.data.len() {
            self.data.resize(self.pos, 0);
        }
        let end = self.pos + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn seek(&mut self, offset: u64) -> crate::Result<u64> {
        self.pos = usize::try_from(offset)?;
        Ok(offset)
    }

    fn close(self: Box<Self>) -> crate::Result<()> {
        if self.writable {
            let mut state = self.store.lock().unwrap();
            state.objects.insert(self.name, self.data);
        }
        Ok(())
    }

    fn abort(self: Box<Self>) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn erasure() -> Erasure {
        Erasure {
            n: 10,
            e: 2,
            o: 0,
            partsz: 1024,
        }
    }

    #[test]
    fn write_is_invisible_until_close() {
        let dal = MemDal::new();
        let mut obj = dal
            .open("o1", Location::default(), erasure(), DalMode::Write)
            .unwrap();
        obj.write(b"hello").unwrap();
        assert!(dal.stat("o1", Location::default()).is_err());
        obj.close().unwrap();
        assert_eq!(dal.stat("o1", Location::default()).unwrap(), 5);
    }

    #[test]
    fn abort_discards() {
        let dal = MemDal::new();
        let mut obj = dal
            .open("o2", Location::default(), erasure(), DalMode::Write)
            .unwrap();
        obj.write(b"junk").unwrap();
        obj.abort().unwrap();
        assert!(dal.stat("o2", Location::default()).is_err());
    }

    #[test]
    fn read_back_with_seek() {
        let dal = MemDal::new();
        let mut obj = dal
            .open("o3", Location::default(), erasure(), DalMode::Write)
            .unwrap();
        obj.write(b"0123456789").unwrap();
        obj.close().unwrap();

        let mut obj = dal
            .open("o3", Location::default(), erasure(), DalMode::Read)
            .unwrap();
        obj.seek(4).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(obj.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"456");
    }

    #[test]
    fn rebuild_clears_injected_damage() {
        let dal = MemDal::new();
        let mut obj = dal
            .open("o4", Location::default(), erasure(), DalMode::Write)
            .unwrap();
        obj.write(b"payload").unwrap();
        obj.close().unwrap();

        dal.inject_damage("o4", 2);
        assert_eq!(
            dal.rebuild("o4", Location::default(), erasure(), None)
                .unwrap(),
            0
        );

        // damage beyond protection leaves a residue once
        dal.inject_damage("o4", 3);
        assert_eq!(
            dal.rebuild("o4", Location::default(), erasure(), None)
                .unwrap(),
            1
        );
        assert_eq!(
            dal.rebuild("o4", Location::default(), erasure(), None)
                .unwrap(),
            0
        );
    }

    #[test]
    fn rebuild_mode_is_not_a_handle() {
        let dal = MemDal::new();
        assert!(dal
            .open("o5", Location::default(), erasure(), DalMode::Rebuild)
            .is_err());
        assert_eq!(erasure().stripe_width(), 12);
    }

    #[test]
    fn wildcard_location_match() {
        let tgt = Location {
            pod: -1,
            cap: 2,
            scatter: -1,
        };
        assert!(tgt.covers(&Location {
            pod: 7,
            cap: 2,
            scatter: 0
        }));
        assert!(!tgt.covers(&Location {
            pod: 7,
            cap: 3,
            scatter: 0
        }));
    }
}

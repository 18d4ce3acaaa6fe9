//! Kernel side of attachment: clsact qdiscs and TC classifier links.

use std::io;

use aya::{
    Ebpf,
    programs::{SchedClassifier, TcAttachType, tc, tc::SchedClassifierLinkId},
};
use tracing::debug;

use crate::iface::IfaceError;

/// TC hook direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub fn name(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    /// Name of the classifier program for this hook in the eBPF object.
    pub fn program_name(self) -> &'static str {
        match self {
            Direction::Ingress => "flowscope_ingress",
            Direction::Egress => "flowscope_egress",
        }
    }

    pub fn attach_type(self) -> TcAttachType {
        match self {
            Direction::Ingress => TcAttachType::Ingress,
            Direction::Egress => TcAttachType::Egress,
        }
    }
}

/// Operations the controller needs from the kernel.
pub trait TcBackend: Send {
    /// Handle returned by [`TcBackend::attach`], needed to detach that link.
    type LinkHandle: Send;

    /// Adds the clsact qdisc if the interface does not have one yet.
    fn ensure_clsact(&mut self, iface: &str) -> Result<(), IfaceError>;

    /// Removes every filter carrying our program name from the hook, including
    /// ones left behind by an earlier process.
    fn purge(&mut self, iface: &str, direction: Direction) -> Result<(), IfaceError>;

    fn attach(&mut self, iface: &str, direction: Direction) -> Result<Self::LinkHandle, IfaceError>;

    fn detach(
        &mut self,
        iface: &str,
        direction: Direction,
        link: Self::LinkHandle,
    ) -> Result<(), IfaceError>;
}

/// [`TcBackend`] over the loaded classifier programs. Owns the [`Ebpf`] object;
/// dropping the backend unloads the programs.
pub struct AyaTcBackend {
    ebpf: Ebpf,
}

impl AyaTcBackend {
    /// Loads both classifier programs into the kernel.
    pub fn new(mut ebpf: Ebpf) -> Result<Self, IfaceError> {
        for direction in Direction::ALL {
            let program_name = direction.program_name();
            classifier(&mut ebpf, direction)?
                .load()
                .map_err(|e| IfaceError::program("load", program_name, e))?;
            debug!(
                event.name = "iface.program_loaded",
                ebpf.program.name = program_name,
                "classifier program loaded"
            );
        }
        Ok(Self { ebpf })
    }
}

fn classifier(ebpf: &mut Ebpf, direction: Direction) -> Result<&mut SchedClassifier, IfaceError> {
    let program_name = direction.program_name();
    ebpf.program_mut(program_name)
        .ok_or(IfaceError::ProgramNotFound {
            program: program_name,
        })?
        .try_into()
        .map_err(|e| IfaceError::program("cast", program_name, e))
}

impl TcBackend for AyaTcBackend {
    type LinkHandle = SchedClassifierLinkId;

    fn ensure_clsact(&mut self, iface: &str) -> Result<(), IfaceError> {
        match tc::qdisc_add_clsact(iface) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(IfaceError::tc("add clsact qdisc", iface, "any", e)),
        }
    }

    fn purge(&mut self, iface: &str, direction: Direction) -> Result<(), IfaceError> {
        match tc::qdisc_detach_program(iface, direction.attach_type(), direction.program_name()) {
            Ok(()) => {
                debug!(
                    event.name = "iface.stale_filters_purged",
                    network.interface.name = %iface,
                    ebpf.program.direction = direction.name(),
                    "removed existing filters before attaching"
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IfaceError::tc("purge filters", iface, direction.name(), e)),
        }
    }

    fn attach(&mut self, iface: &str, direction: Direction) -> Result<Self::LinkHandle, IfaceError> {
        classifier(&mut self.ebpf, direction)?
            .attach(iface, direction.attach_type())
            .map_err(|e| IfaceError::tc("attach", iface, direction.name(), e))
    }

    fn detach(
        &mut self,
        iface: &str,
        direction: Direction,
        link: Self::LinkHandle,
    ) -> Result<(), IfaceError> {
        classifier(&mut self.ebpf, direction)?
            .detach(link)
            .map_err(|e| IfaceError::tc("detach", iface, direction.name(), e))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;

    /// In-memory kernel: counts filters per hook so duplicate attachments are
    /// visible.
    #[derive(Default)]
    pub struct FakeTcBackend {
        pub clsact: HashSet<String>,
        pub filters: HashMap<(String, Direction), HashSet<u32>>,
        pub fail_attach: HashSet<(String, Direction)>,
        pub fail_clsact: HashSet<String>,
        next_link: u32,
    }

    impl FakeTcBackend {
        pub fn filter_count(&self, iface: &str, direction: Direction) -> usize {
            self.filters
                .get(&(iface.to_string(), direction))
                .map_or(0, HashSet::len)
        }

        pub fn total_filters(&self) -> usize {
            self.filters.values().map(HashSet::len).sum()
        }
    }

    impl TcBackend for FakeTcBackend {
        type LinkHandle = u32;

        fn ensure_clsact(&mut self, iface: &str) -> Result<(), IfaceError> {
            if self.fail_clsact.contains(iface) {
                return Err(IfaceError::tc("add clsact qdisc", iface, "any", "no such device"));
            }
            self.clsact.insert(iface.to_string());
            Ok(())
        }

        fn purge(&mut self, iface: &str, direction: Direction) -> Result<(), IfaceError> {
            self.filters.remove(&(iface.to_string(), direction));
            Ok(())
        }

        fn attach(&mut self, iface: &str, direction: Direction) -> Result<u32, IfaceError> {
            let key = (iface.to_string(), direction);
            if self.fail_attach.contains(&key) {
                return Err(IfaceError::tc("attach", iface, direction.name(), "permission denied"));
            }
            self.next_link += 1;
            self.filters.entry(key).or_default().insert(self.next_link);
            Ok(self.next_link)
        }

        fn detach(&mut self, iface: &str, direction: Direction, link: u32) -> Result<(), IfaceError> {
            let removed = self
                .filters
                .get_mut(&(iface.to_string(), direction))
                .is_some_and(|links| links.remove(&link));
            if removed {
                Ok(())
            } else {
                Err(IfaceError::tc("detach", iface, direction.name(), "link not found"))
            }
        }
    }

    #[test]
    fn test_direction_names() {
        assert_eq!(Direction::Ingress.name(), "ingress");
        assert_eq!(Direction::Egress.program_name(), "flowscope_egress");
        assert!(matches!(Direction::Ingress.attach_type(), TcAttachType::Ingress));
    }
}

use super::machine::Machine;
use crate::database::ID;
use std::collections::BTreeMap;

/// The static physical hierarchy of one datacenter.
///
/// Topologies are immutable once assembled from the store; only the machines
/// inside them carry per-tick state. The datacenter owns its machines
/// exclusively, everything else refers to them by id.
#[derive(Debug, Clone, Default)]
pub struct Datacenter {
    id: ID,
    rooms: Vec<Room>,
}

#[derive(Debug, Clone)]
pub enum Room {
    Server(ServerRoom),
    Hallway { id: ID },
    Power { id: ID },
}

impl Room {
    pub fn id(&self) -> ID {
        match self {
            Self::Server(room) => room.id,
            Self::Hallway { id } | Self::Power { id } => *id,
        }
    }

    fn as_server(&self) -> Option<&ServerRoom> {
        match self {
            Self::Server(room) => Some(room),
            _ => None,
        }
    }

    fn as_server_mut(&mut self) -> Option<&mut ServerRoom> {
        match self {
            Self::Server(room) => Some(room),
            _ => None,
        }
    }
}

/// Only server rooms hold racks.
#[derive(Debug, Clone)]
pub struct ServerRoom {
    id: ID,
    racks: Vec<Rack>,
}

impl ServerRoom {
    pub fn new(id: ID) -> Self {
        Self {
            id,
            racks: Vec::new(),
        }
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn add_rack(&mut self, rack: Rack) {
        self.racks.push(rack);
    }
}

/// A rack maps slot positions to machines.
#[derive(Debug, Clone)]
pub struct Rack {
    id: ID,
    machines: BTreeMap<u32, Machine>,
}

impl Rack {
    pub fn new(id: ID) -> Self {
        Self {
            id,
            machines: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn insert_machine(&mut self, position: u32, machine: Machine) {
        self.machines.insert(position, machine);
    }

    pub fn machine_at_slot_mut(&mut self, position: u32) -> Option<&mut Machine> {
        self.machines.get_mut(&position)
    }
}

impl Datacenter {
    pub fn new(id: ID) -> Self {
        Self {
            id,
            rooms: Vec::new(),
        }
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn add_room(&mut self, room: Room) {
        self.rooms.push(room);
    }

    /// Flat view over all machines, ordered by room, rack and slot.
    pub fn machines(&self) -> Vec<&Machine> {
        self.rooms
            .iter()
            .filter_map(Room::as_server)
            .flat_map(|room| room.racks.iter())
            .flat_map(|rack| rack.machines.values())
            .collect()
    }

    pub fn machines_mut(&mut self) -> Vec<&mut Machine> {
        self.rooms
            .iter_mut()
            .filter_map(Room::as_server_mut)
            .flat_map(|room| room.racks.iter_mut())
            .flat_map(|rack| rack.machines.values_mut())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_view_skips_non_server_rooms() {
        let mut rack = Rack::new(1);
        rack.insert_machine(0, Machine::new(10));
        rack.insert_machine(1, Machine::new(11));

        let mut room = ServerRoom::new(1);
        room.add_rack(rack);

        let mut datacenter = Datacenter::new(1);
        datacenter.add_room(Room::Hallway { id: 2 });
        datacenter.add_room(Room::Server(room));
        datacenter.add_room(Room::Power { id: 3 });

        let ids: Vec<_> = datacenter
            .machines()
            .iter()
            .map(|machine| machine.id())
            .collect();
        assert_eq!(ids, vec![10, 11]);
    }

    #[test]
    fn machines_are_ordered_by_slot() {
        let mut rack = Rack::new(1);
        rack.insert_machine(3, Machine::new(30));
        rack.insert_machine(1, Machine::new(10));

        let mut room = ServerRoom::new(1);
        room.add_rack(rack);

        let mut datacenter = Datacenter::new(1);
        datacenter.add_room(Room::Server(room));

        let ids: Vec<_> = datacenter
            .machines_mut()
            .iter()
            .map(|machine| machine.id())
            .collect();
        assert_eq!(ids, vec![10, 30]);
    }
}

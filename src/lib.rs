/*!
    EtherCAT master control stack running a cyclic realtime loop against a ring of slaves.

    This crate drives the application layer of an ethercat segment on top of a [BusTransport] doing the frame exchange:

    - [Master] checks the bus against the registered slaves, maps the process image and exchanges it every cycle
    - the housekeeping ([statemachine]) brings every slave to OP, waits for its distributed clock to settle, and recovers the slaves that dropped out, one small step per cycle
    - [sdo] objects are transferred in the background without ever blocking the cycle
    - [coordinator] hands the shared data between the cyclic thread and the housekeeping thread without locks
    - [realtime] runs the whole on a periodic realtime thread

    Registration of the slaves and their PDOs is explicit: the master does not read the slaves' information to guess them, it checks the bus matches what was registered.
*/

pub mod data;
pub mod error;
pub mod registers;
pub mod transport;
pub mod layout;
pub mod mapping;
pub mod sdo;
pub mod status;
pub mod config;
pub mod slave;
pub mod pipeline;
pub mod coordinator;
pub mod statemachine;
pub mod master;
pub mod realtime;

pub use crate::data::{PduData, Field, BitField};
pub use crate::error::{EthercatError, EthercatResult, ConfigError};
pub use crate::transport::{BusTransport, Receive};
pub use crate::config::{MasterConfig, HousekeepingMode};
pub use crate::mapping::{Mapping, Direction, Entry};
pub use crate::sdo::{SdoObject, ReadSdo, WriteSdo};
pub use crate::slave::{Slave, Device, SlaveState, SlaveStatus};
pub use crate::status::{StatusCallback, LogStatus, TraceEvent};
pub use crate::master::{Master, SlaveHandle};
pub use crate::realtime::{RealtimeThread, CyclicController, Cyclic, Stop};

use crate::error::Result;

/// Register-level transport used by the task scheduler
#[async_trait::async_trait]
pub trait ModbusLike: Send {
    async fn read_holding_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    async fn write_single_register(&mut self, slave_id: u8, address: u16, value: u16)
    -> Result<()>;

    async fn write_multiple_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()>;
}

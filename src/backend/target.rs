use crate::{
    backend::registers::Register,
    intern::InternedSymbol,
    ty::{MAX_ROUND, POINTER_WIDTH},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Target {
    Amd64,
}

impl Target {
    pub fn abi(self) -> TargetAbi {
        match self {
            Target::Amd64 => TargetAbi {
                pointer_width: POINTER_WIDTH,
                max_round: MAX_ROUND,
                dividend: Register::Ax,
                remainder: Register::Dx,
                shift_count: Register::Cx,
                fill_value: Register::Ax,
                fill_destination: Register::Di,
                fill_count: Register::Cx,
                panic_register: Register::Ax,
                panic_sentinel: 0xf0,
                method_table_header: 4 * POINTER_WIDTH,
                spawn_helper: InternedSymbol::new("newproc"),
                concrete_to_interface: InternedSymbol::new("ifaces2i"),
                interface_to_interface: InternedSymbol::new("ifacei2i"),
                interface_to_concrete: InternedSymbol::new("ifacei2s"),
            },
        }
    }
}

/// Calling convention constants of a target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetAbi {
    pub pointer_width: i64,
    /// Largest alignment applied to frame slots and frame sizes
    pub max_round: i64,
    /// Holds the dividend and receives the quotient
    pub dividend: Register,
    /// Holds the high half of the dividend and receives the remainder
    pub remainder: Register,
    pub shift_count: Register,
    /// Block stores write this register's value to the destination register's
    /// address, count register times
    pub fill_value: Register,
    pub fill_destination: Register,
    pub fill_count: Register,
    pub panic_register: Register,
    /// Address dereferenced to raise a panic
    pub panic_sentinel: i64,
    /// Bytes preceding the first function pointer of a method table
    pub method_table_header: i64,
    pub spawn_helper: InternedSymbol,
    pub concrete_to_interface: InternedSymbol,
    pub interface_to_interface: InternedSymbol,
    pub interface_to_concrete: InternedSymbol,
}

impl TargetAbi {
    /// Offset into a method table of the function pointer for the method
    /// declared at `index`
    pub fn method_offset(&self, index: usize) -> i64 {
        self.method_table_header + index as i64 * self.pointer_width
    }
}

impl Default for TargetAbi {
    fn default() -> Self {
        Target::Amd64.abi()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_offsets_skip_the_table_header() {
        let abi = Target::Amd64.abi();

        assert_eq!(abi.method_offset(0), 32);
        assert_eq!(abi.method_offset(2), abi.method_table_header + 16);
    }
}
